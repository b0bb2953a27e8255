//! The attention slot: a single unit of human focus.
//!
//! A winning attention bid occupies the slot and becomes a delivered prompt.
//! The slot stays held until the human responds or the response window
//! closes, whichever comes first.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::config::ScoreWeights;
use crate::error::EconomyError;
use crate::types::{AgentId, Bid, BidId, Credits, HumanResponse, PromptId, Scores};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptStatus {
    Delivered,
    Responded,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    pub id: PromptId,
    pub bid_id: BidId,
    pub agent_id: AgentId,
    pub payload: Value,
    /// Credits burned when the slot was granted.
    pub cost: Credits,
    pub cycle: u64,
    pub delivered_at: DateTime<Utc>,
    pub respond_by: DateTime<Utc>,
    pub status: PromptStatus,
    pub scores: Option<Scores>,
    pub reason: Option<String>,
    pub reward: Option<Credits>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Prompt {
    pub fn delivery(&self) -> PromptDelivery {
        PromptDelivery {
            prompt_id: self.id.clone(),
            bid_id: self.bid_id.clone(),
            agent_id: self.agent_id.clone(),
            payload: self.payload.clone(),
            delivered_at: self.delivered_at,
            respond_by: self.respond_by,
        }
    }
}

/// What the human-facing collaborator receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptDelivery {
    pub prompt_id: PromptId,
    pub bid_id: BidId,
    pub agent_id: AgentId,
    pub payload: Value,
    pub delivered_at: DateTime<Utc>,
    pub respond_by: DateTime<Utc>,
}

/// Outcome of scoring a prompt. The caller settles `reward` from `HUMAN`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPrompt {
    pub prompt_id: PromptId,
    pub agent_id: AgentId,
    pub reward: Credits,
}

/// `Σ score × weight`, checked.
pub fn score_to_credits(scores: &Scores, weights: &ScoreWeights) -> Option<Credits> {
    let terms = [
        (scores.interesting, weights.interesting),
        (scores.useful, weights.useful),
        (scores.understandable, weights.understandable),
    ];
    terms.iter().try_fold(Credits::ZERO, |acc, (score, weight)| {
        weight
            .checked_mul(u64::from(*score))
            .and_then(|term| acc.checked_add(term))
    })
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttentionSlot {
    held: Option<PromptId>,
    prompts: BTreeMap<PromptId, Prompt>,
}

impl AttentionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_free(&self) -> bool {
        self.held.is_none()
    }

    /// The prompt currently occupying the slot.
    pub fn holder(&self) -> Option<&Prompt> {
        self.held.as_ref().and_then(|id| self.prompts.get(id))
    }

    pub fn is_held_by(&self, agent: &AgentId) -> bool {
        self.holder().is_some_and(|prompt| &prompt.agent_id == agent)
    }

    pub fn prompt(&self, id: &PromptId) -> Option<&Prompt> {
        self.prompts.get(id)
    }

    /// Prompts still awaiting a response.
    pub fn pending(&self) -> Vec<PromptDelivery> {
        self.prompts
            .values()
            .filter(|prompt| prompt.status == PromptStatus::Delivered)
            .map(Prompt::delivery)
            .collect()
    }

    /// Occupy the slot with a winning attention bid.
    pub fn deliver(
        &mut self,
        bid: &Bid,
        cycle: u64,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<PromptDelivery, EconomyError> {
        if let Some(held) = &self.held {
            return Err(EconomyError::InvariantViolation(format!(
                "attention slot already held by prompt {}",
                held
            )));
        }
        let payload = bid
            .prompt
            .clone()
            .ok_or_else(|| EconomyError::InvalidBundle("attention bid without prompt".into()))?;

        let prompt = Prompt {
            id: PromptId::generate(),
            bid_id: bid.id.clone(),
            agent_id: bid.agent_id.clone(),
            payload,
            cost: bid.total_cost,
            cycle,
            delivered_at: now,
            respond_by: now + timeout,
            status: PromptStatus::Delivered,
            scores: None,
            reason: None,
            reward: None,
            closed_at: None,
        };
        let delivery = prompt.delivery();
        info!(
            prompt = %prompt.id,
            agent = %prompt.agent_id,
            respond_by = %prompt.respond_by,
            "Attention slot granted"
        );
        self.held = Some(prompt.id.clone());
        self.prompts.insert(prompt.id.clone(), prompt);
        Ok(delivery)
    }

    /// Record a human response and free the slot.
    ///
    /// Responses arriving after the deadline but before the next cycle's
    /// expiry sweep are treated as expired.
    pub fn respond(
        &mut self,
        response: &HumanResponse,
        weights: &ScoreWeights,
        now: DateTime<Utc>,
    ) -> Result<ScoredPrompt, EconomyError> {
        if !response.scores.is_valid() {
            return Err(EconomyError::InvalidScores);
        }
        let prompt = self
            .prompts
            .get_mut(&response.prompt_id)
            .ok_or_else(|| EconomyError::PromptNotFound(response.prompt_id.clone()))?;
        if prompt.status != PromptStatus::Delivered || now > prompt.respond_by {
            return Err(EconomyError::PromptClosed(response.prompt_id.clone()));
        }
        let reward = score_to_credits(&response.scores, weights)
            .ok_or_else(|| EconomyError::overflow("attention reward"))?;

        prompt.status = PromptStatus::Responded;
        prompt.scores = Some(response.scores);
        prompt.reason = response.reason.clone();
        prompt.reward = Some(reward);
        prompt.closed_at = Some(now);
        let scored = ScoredPrompt {
            prompt_id: prompt.id.clone(),
            agent_id: prompt.agent_id.clone(),
            reward,
        };

        if self.held.as_ref() == Some(&response.prompt_id) {
            self.held = None;
        }
        debug!(prompt = %scored.prompt_id, reward = %reward, "Prompt answered");
        Ok(scored)
    }

    /// Expire the held prompt once its response window has passed.
    pub fn expire_overdue(&mut self, now: DateTime<Utc>) -> Vec<Prompt> {
        let mut expired = Vec::new();
        for prompt in self.prompts.values_mut() {
            if prompt.status == PromptStatus::Delivered && now >= prompt.respond_by {
                prompt.status = PromptStatus::Expired;
                prompt.closed_at = Some(now);
                expired.push(prompt.clone());
            }
        }
        if let Some(held) = &self.held {
            if expired.iter().any(|prompt| &prompt.id == held) {
                info!(prompt = %held, "Attention slot released after timeout");
                self.held = None;
            }
        }
        expired
    }
}
