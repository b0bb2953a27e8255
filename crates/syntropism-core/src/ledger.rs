//! Credit ledger: balances, bid reservations and the append-only transaction log.
//!
//! The ledger is a plain owned value. Linearizability comes from its owner
//! (`Economy`) serializing every mutation behind a single lock; the ledger itself
//! guarantees that each operation either fully applies or has no effect.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::EconomyError;
use crate::types::{Agent, AgentId, AgentStatus, Bid, BidId, Credits};

/// Ledger account: an agent, or one of the two reserved sinks.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Account {
    Agent(AgentId),
    /// Credits spent on resources leave circulation here.
    Burn,
    /// Attention rewards enter circulation from here.
    Human,
}

impl Account {
    pub fn agent(id: impl Into<AgentId>) -> Self {
        Self::Agent(id.into())
    }

    pub fn agent_id(&self) -> Option<&AgentId> {
        match self {
            Self::Agent(id) => Some(id),
            Self::Burn | Self::Human => None,
        }
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Agent(id) => write!(f, "{}", id),
            Self::Burn => f.write_str("BURN"),
            Self::Human => f.write_str("HUMAN"),
        }
    }
}

/// Immutable, hash-chained ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub index: u64,
    pub from: Account,
    pub to: Account,
    pub amount: Credits,
    pub memo: String,
    pub timestamp: DateTime<Utc>,
    pub previous_hash: Option<String>,
    pub entry_hash: String,
}

impl Transaction {
    pub fn involves(&self, account: &Account) -> bool {
        &self.from == account || &self.to == account
    }
}

/// Append-only transaction log with hash-chain proofs.
///
/// No mutation API exists besides `append`; tampering with a persisted log is
/// detected by `verify_chain`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionLog {
    entries: Vec<Transaction>,
}

impl TransactionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a log from persisted entries and verify hash-chain integrity.
    pub fn from_entries(entries: Vec<Transaction>) -> Result<Self, EconomyError> {
        let log = Self { entries };
        log.verify()?;
        Ok(log)
    }

    pub fn entries(&self) -> &[Transaction] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn verify_chain(&self) -> bool {
        self.verify().is_ok()
    }

    fn verify(&self) -> Result<(), EconomyError> {
        let mut previous_hash: Option<String> = None;
        for (expected_index, entry) in self.entries.iter().enumerate() {
            if entry.index != expected_index as u64 {
                return Err(EconomyError::StructuralFailure(format!(
                    "transaction log index gap at position {} (found {})",
                    expected_index, entry.index
                )));
            }
            if entry.previous_hash != previous_hash {
                return Err(EconomyError::StructuralFailure(format!(
                    "transaction log previous-hash mismatch at index {}",
                    entry.index
                )));
            }
            let expected_hash = compute_entry_hash(
                entry.index,
                &entry.from,
                &entry.to,
                entry.amount,
                &entry.memo,
                entry.timestamp,
                previous_hash.as_deref(),
            );
            if entry.entry_hash != expected_hash {
                return Err(EconomyError::StructuralFailure(format!(
                    "transaction log hash mismatch at index {}",
                    entry.index
                )));
            }
            previous_hash = Some(entry.entry_hash.clone());
        }
        Ok(())
    }

    fn append(
        &mut self,
        from: Account,
        to: Account,
        amount: Credits,
        memo: String,
        timestamp: DateTime<Utc>,
    ) -> Transaction {
        let index = self.entries.len() as u64;
        let previous_hash = self.entries.last().map(|entry| entry.entry_hash.clone());
        let entry_hash = compute_entry_hash(
            index,
            &from,
            &to,
            amount,
            &memo,
            timestamp,
            previous_hash.as_deref(),
        );
        let entry = Transaction {
            id: Uuid::new_v4().to_string(),
            index,
            from,
            to,
            amount,
            memo,
            timestamp,
            previous_hash,
            entry_hash,
        };
        self.entries.push(entry.clone());
        entry
    }

    /// Entries touching `account`, most recent first.
    pub fn history(&self, account: &Account, limit: usize) -> Vec<Transaction> {
        self.entries
            .iter()
            .rev()
            .filter(|entry| entry.involves(account))
            .take(limit)
            .cloned()
            .collect()
    }
}

fn compute_entry_hash(
    index: u64,
    from: &Account,
    to: &Account,
    amount: Credits,
    memo: &str,
    timestamp: DateTime<Utc>,
    previous_hash: Option<&str>,
) -> String {
    let material: Value = serde_json::json!({
        "index": index,
        "from": from,
        "to": to,
        "amount": amount,
        "memo": memo,
        "timestamp": timestamp,
        "previous_hash": previous_hash,
    });

    let bytes = serde_json::to_vec(&material).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}

/// Credits held back for one Pending bid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub bid_id: BidId,
    pub agent_id: AgentId,
    pub amount: Credits,
}

/// Running totals for the conservation equation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplyTotals {
    pub endowed: Credits,
    pub burned: Credits,
    pub injected: Credits,
}

/// `Σ balances + burned − injected == endowed`, evaluated at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConservationReport {
    pub total_balances: Credits,
    pub burned: Credits,
    pub injected: Credits,
    pub endowed: Credits,
    pub balanced: bool,
}

/// Full replay of the log against stored balances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerAudit {
    pub conservation: ConservationReport,
    pub chain_valid: bool,
    pub transactions: usize,
    /// Agents whose replayed balance differs from the stored one.
    pub mismatched_agents: Vec<AgentId>,
}

impl LedgerAudit {
    pub fn is_clean(&self) -> bool {
        self.conservation.balanced && self.chain_valid && self.mismatched_agents.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ledger {
    agents: BTreeMap<AgentId, Agent>,
    reservations: BTreeMap<BidId, Reservation>,
    log: TransactionLog,
    totals: SupplyTotals,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-verify a deserialized ledger before it is trusted.
    pub fn restore(self) -> Result<Self, EconomyError> {
        let Ledger {
            agents,
            reservations,
            log,
            totals,
        } = self;
        let log = TransactionLog::from_entries(log.entries)?;
        let ledger = Ledger {
            agents,
            reservations,
            log,
            totals,
        };
        let audit = ledger.audit();
        if !audit.is_clean() {
            return Err(EconomyError::StructuralFailure(format!(
                "persisted ledger failed audit (balanced={}, mismatched={})",
                audit.conservation.balanced,
                audit.mismatched_agents.len()
            )));
        }
        Ok(ledger)
    }

    /// Create an Alive agent with an initial endowment.
    pub fn open_account(
        &mut self,
        id: AgentId,
        endowment: Credits,
        lineage: Vec<AgentId>,
        now: DateTime<Utc>,
    ) -> Result<&Agent, EconomyError> {
        if self.agents.contains_key(&id) {
            return Err(EconomyError::AgentExists(id));
        }
        let endowed = self
            .totals
            .endowed
            .checked_add(endowment)
            .ok_or_else(|| EconomyError::overflow("endowment"))?;

        let mut agent = Agent::new(id.clone(), endowment, now);
        agent.lineage = lineage;
        self.totals.endowed = endowed;
        debug!(agent = %id, endowment = %endowment, "Opened ledger account");
        Ok(self.agents.entry(id).or_insert(agent))
    }

    pub fn agent(&self, id: &AgentId) -> Option<&Agent> {
        self.agents.get(id)
    }

    pub fn agents(&self) -> impl Iterator<Item = &Agent> {
        self.agents.values()
    }

    fn existing(&self, id: &AgentId) -> Result<&Agent, EconomyError> {
        self.agents
            .get(id)
            .ok_or_else(|| EconomyError::AgentNotFound(id.clone()))
    }

    fn existing_mut(&mut self, id: &AgentId) -> Result<&mut Agent, EconomyError> {
        self.agents
            .get_mut(id)
            .ok_or_else(|| EconomyError::AgentNotFound(id.clone()))
    }

    pub fn balance(&self, id: &AgentId) -> Result<Credits, EconomyError> {
        Ok(self.existing(id)?.balance)
    }

    /// Sum of the agent's Pending-bid reservations.
    pub fn reserved(&self, id: &AgentId) -> Credits {
        self.reservations
            .values()
            .filter(|reservation| &reservation.agent_id == id)
            .fold(Credits::ZERO, |acc, reservation| {
                acc.checked_add(reservation.amount).unwrap_or(acc)
            })
    }

    /// Balance minus reservations.
    pub fn available(&self, id: &AgentId) -> Result<Credits, EconomyError> {
        let balance = self.balance(id)?;
        Ok(balance.saturating_sub(self.reserved(id)))
    }

    pub fn reservation(&self, bid_id: &BidId) -> Option<&Reservation> {
        self.reservations.get(bid_id)
    }

    pub fn totals(&self) -> SupplyTotals {
        self.totals
    }

    pub fn log(&self) -> &TransactionLog {
        &self.log
    }

    /// Transactions touching the agent, most recent first.
    pub fn history(&self, id: &AgentId, limit: usize) -> Result<Vec<Transaction>, EconomyError> {
        self.existing(id)?;
        Ok(self.log.history(&Account::Agent(id.clone()), limit))
    }

    /// Atomically move `amount` from `from` to `to`.
    ///
    /// An agent source must hold at least `amount` of *available* balance.
    /// `HUMAN` as source creates credits, `BURN` as target destroys them.
    pub fn transfer(
        &mut self,
        from: &Account,
        to: &Account,
        amount: Credits,
        memo: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Transaction, EconomyError> {
        if amount.is_zero() {
            return Err(EconomyError::InvalidAmount(
                "transfer amount must be positive".to_string(),
            ));
        }
        if from == to {
            return Err(EconomyError::InvalidTransfer(format!(
                "source and target are both {}",
                from
            )));
        }

        let mut totals = self.totals;
        let debited = match from {
            Account::Agent(id) => {
                let agent = self.live(id)?;
                let available = agent.balance.saturating_sub(self.reserved(id));
                if available < amount {
                    return Err(EconomyError::InsufficientFunds {
                        agent: id.clone(),
                        requested: amount,
                        available,
                    });
                }
                Some((id.clone(), agent.balance.saturating_sub(amount)))
            }
            Account::Human => {
                totals.injected = totals
                    .injected
                    .checked_add(amount)
                    .ok_or_else(|| EconomyError::overflow("human injection"))?;
                None
            }
            Account::Burn => {
                return Err(EconomyError::InvalidTransfer(
                    "the BURN sink cannot be debited".to_string(),
                ))
            }
        };

        let credited = match to {
            Account::Agent(id) => {
                let agent = self.live(id)?;
                let balance = agent
                    .balance
                    .checked_add(amount)
                    .ok_or_else(|| EconomyError::overflow("credit"))?;
                Some((id.clone(), balance))
            }
            Account::Burn => {
                totals.burned = totals
                    .burned
                    .checked_add(amount)
                    .ok_or_else(|| EconomyError::overflow("burn"))?;
                None
            }
            Account::Human => {
                return Err(EconomyError::InvalidTransfer(
                    "the HUMAN source cannot be credited".to_string(),
                ))
            }
        };

        if debited.is_none() && credited.is_none() {
            return Err(EconomyError::InvalidTransfer(
                "a transfer must involve an agent".to_string(),
            ));
        }

        // All checks passed: apply.
        if let Some((id, balance)) = debited {
            let agent = self.existing_mut(&id)?;
            agent.balance = balance;
            agent.total_spent = agent.total_spent.checked_add(amount).unwrap_or(agent.total_spent);
        }
        if let Some((id, balance)) = credited {
            let agent = self.existing_mut(&id)?;
            agent.balance = balance;
            agent.total_earned = agent
                .total_earned
                .checked_add(amount)
                .unwrap_or(agent.total_earned);
        }
        self.totals = totals;

        let memo = memo.into();
        debug!(from = %from, to = %to, amount = %amount, memo = %memo, "Ledger transfer");
        Ok(self.log.append(from.clone(), to.clone(), amount, memo, now))
    }

    fn live(&self, id: &AgentId) -> Result<&Agent, EconomyError> {
        let agent = self.existing(id)?;
        if !agent.is_alive() {
            return Err(EconomyError::AgentTerminated(id.clone()));
        }
        Ok(agent)
    }

    /// Hold back `amount` of the agent's available balance for a Pending bid.
    pub fn reserve(
        &mut self,
        bid_id: BidId,
        agent_id: &AgentId,
        amount: Credits,
    ) -> Result<(), EconomyError> {
        if self.reservations.contains_key(&bid_id) {
            return Err(EconomyError::InvariantViolation(format!(
                "bid {} already holds a reservation",
                bid_id
            )));
        }
        self.live(agent_id)?;
        let available = self.available(agent_id)?;
        if available < amount {
            return Err(EconomyError::InsufficientFunds {
                agent: agent_id.clone(),
                requested: amount,
                available,
            });
        }
        self.reservations.insert(
            bid_id.clone(),
            Reservation {
                bid_id,
                agent_id: agent_id.clone(),
                amount,
            },
        );
        Ok(())
    }

    pub fn release(&mut self, bid_id: &BidId) -> Option<Reservation> {
        self.reservations.remove(bid_id)
    }

    /// Release the bid's reservation and burn its cost.
    ///
    /// Fails with `ConcurrentBalanceChange` when the agent's balance no longer
    /// covers the cost. The reservation is gone either way; the caller demotes
    /// the bid.
    pub fn settle_bid(
        &mut self,
        bid: &Bid,
        memo: &str,
        now: DateTime<Utc>,
    ) -> Result<Transaction, EconomyError> {
        self.release(&bid.id);
        self.transfer(
            &Account::Agent(bid.agent_id.clone()),
            &Account::Burn,
            bid.total_cost,
            memo,
            now,
        )
        .map_err(|err| match err {
            EconomyError::InsufficientFunds { .. } | EconomyError::AgentTerminated(_) => {
                EconomyError::ConcurrentBalanceChange {
                    agent: bid.agent_id.clone(),
                    bid: bid.id.clone(),
                }
            }
            other => other,
        })
    }

    pub fn record_execution(&mut self, id: &AgentId, now: DateTime<Utc>) -> Result<(), EconomyError> {
        let agent = self.existing_mut(id)?;
        agent.execution_count += 1;
        agent.last_execution = Some(now);
        Ok(())
    }

    pub fn mark_dead(&mut self, id: &AgentId, now: DateTime<Utc>) -> Result<(), EconomyError> {
        let agent = self.existing_mut(id)?;
        agent.status = AgentStatus::Dead;
        agent.terminated_at = Some(now);
        Ok(())
    }

    pub fn conservation_report(&self) -> ConservationReport {
        let total_balances = self
            .agents
            .values()
            .map(|agent| agent.balance.minor() as u128)
            .sum::<u128>();
        let lhs = total_balances + self.totals.burned.minor() as u128;
        let rhs = self.totals.endowed.minor() as u128 + self.totals.injected.minor() as u128;

        ConservationReport {
            total_balances: Credits::from_minor(total_balances.min(u64::MAX as u128) as u64),
            burned: self.totals.burned,
            injected: self.totals.injected,
            endowed: self.totals.endowed,
            balanced: lhs == rhs,
        }
    }

    /// Fail loudly when conservation does not hold.
    pub fn check_conservation(&self) -> Result<ConservationReport, EconomyError> {
        let report = self.conservation_report();
        if !report.balanced {
            error!(
                balances = %report.total_balances,
                burned = %report.burned,
                injected = %report.injected,
                endowed = %report.endowed,
                "Credit conservation violated"
            );
            return Err(EconomyError::InvariantViolation(format!(
                "conservation violated: balances {} + burned {} - injected {} != endowed {}",
                report.total_balances, report.burned, report.injected, report.endowed
            )));
        }
        Ok(report)
    }

    /// Replay the whole log from the endowments and compare with stored state.
    pub fn audit(&self) -> LedgerAudit {
        let mut replayed: BTreeMap<&AgentId, i128> = self
            .agents
            .values()
            .map(|agent| (&agent.id, agent.initial_endowment.minor() as i128))
            .collect();
        let mut burned: i128 = 0;
        let mut injected: i128 = 0;

        for entry in self.log.entries() {
            let amount = entry.amount.minor() as i128;
            match &entry.from {
                Account::Agent(id) => *replayed.entry(id).or_insert(0) -= amount,
                Account::Human => injected += amount,
                Account::Burn => {}
            }
            match &entry.to {
                Account::Agent(id) => *replayed.entry(id).or_insert(0) += amount,
                Account::Burn => burned += amount,
                Account::Human => {}
            }
        }

        let mismatched_agents = replayed
            .into_iter()
            .filter(|(id, balance)| {
                self.agents
                    .get(*id)
                    .map(|agent| agent.balance.minor() as i128 != *balance)
                    .unwrap_or(true)
            })
            .map(|(id, _)| id.clone())
            .collect();

        let mut conservation = self.conservation_report();
        conservation.balanced = conservation.balanced
            && burned == self.totals.burned.minor() as i128
            && injected == self.totals.injected.minor() as i128;

        LedgerAudit {
            conservation,
            chain_valid: self.log.verify_chain(),
            transactions: self.log.len(),
            mismatched_agents,
        }
    }
}
