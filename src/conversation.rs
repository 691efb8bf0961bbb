//! Follow-up questions grounded in a finished report.
//!
//! A [`ConversationContext`] owns one [`Report`] and the turns asked about
//! it. Each prompt is the report preamble, then as many of the most recent
//! turns as fit the token budget (oldest dropped first), then the new
//! question. A report that alone exceeds the budget is truncated.

use tokio_util::sync::CancellationToken;

use crate::completion::{CompletionClient, CompletionRequest, Message};
use crate::error::ConversationError;
use crate::models::{ConversationTurn, Report};
use crate::prompts;
use crate::tokens::TokenEstimator;

pub struct ConversationContext {
    report: Report,
    turns: Vec<ConversationTurn>,
    next_sequence: u64,
    client: CompletionClient,
    estimator: TokenEstimator,
    token_budget: usize,
    max_output_tokens: u32,
}

impl ConversationContext {
    pub fn new(
        report: Report,
        client: CompletionClient,
        estimator: TokenEstimator,
        token_budget: usize,
        max_output_tokens: u32,
    ) -> Self {
        Self {
            report,
            turns: Vec::new(),
            next_sequence: 0,
            client,
            estimator,
            token_budget,
            max_output_tokens,
        }
    }

    pub fn report(&self) -> &Report {
        &self.report
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    /// Forget every turn; the next question starts again at sequence 0.
    pub fn reset(&mut self) {
        self.turns.clear();
        self.next_sequence = 0;
    }

    fn messages_cost(&self, messages: &[Message]) -> usize {
        messages
            .iter()
            .map(|m| self.estimator.estimate(&m.content))
            .sum()
    }

    /// The request `ask` would send for `question`.
    pub fn build_request(&self, question: &str) -> CompletionRequest {
        let fixed = self.messages_cost(&prompts::conversation_preamble(&self.report.repository, ""))
            + self.estimator.estimate(question);
        let report_text = self
            .estimator
            .truncate(&self.report.text, self.token_budget.saturating_sub(fixed));
        let mut messages = prompts::conversation_preamble(&self.report.repository, &report_text);

        let mut remaining = self
            .token_budget
            .saturating_sub(self.messages_cost(&messages) + self.estimator.estimate(question));

        let mut window: Vec<&ConversationTurn> = Vec::new();
        for turn in self.turns.iter().rev() {
            let cost = self.estimator.estimate(&turn.question) + self.estimator.estimate(&turn.answer);
            if cost > remaining {
                break;
            }
            remaining -= cost;
            window.push(turn);
        }
        if window.len() < self.turns.len() {
            tracing::debug!(
                kept = window.len(),
                dropped = self.turns.len() - window.len(),
                "conversation window trimmed"
            );
        }

        for turn in window.into_iter().rev() {
            messages.push(Message::user(turn.question.clone()));
            messages.push(Message::assistant(turn.answer.clone()));
        }
        messages.push(Message::user(question));

        CompletionRequest {
            messages,
            max_output_tokens: self.max_output_tokens,
        }
    }

    /// Ask a follow-up question. A failed call appends no turn.
    pub async fn ask(&mut self, question: &str) -> Result<ConversationTurn, ConversationError> {
        self.ask_with_cancel(question, &CancellationToken::new()).await
    }

    pub async fn ask_with_cancel(
        &mut self,
        question: &str,
        cancel: &CancellationToken,
    ) -> Result<ConversationTurn, ConversationError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(ConversationError::EmptyQuestion);
        }

        let request = self.build_request(question);
        let answer = self.client.complete(&request, cancel).await?;

        let turn = ConversationTurn {
            sequence: self.next_sequence,
            question: question.to_string(),
            answer,
        };
        self.next_sequence += 1;
        self.turns.push(turn.clone());
        tracing::debug!(sequence = turn.sequence, "conversation turn recorded");
        Ok(turn)
    }
}
