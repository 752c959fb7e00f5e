//! Workflow vocabulary and the transition table.
//!
//! Every borrow request carries the same nine-step graph. The graph, the
//! status codes and what each status does are all defined by [`TRANSITIONS`];
//! the workflow engine only interprets it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::book::CopyStatus;

/// Sub-workflow of a loan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkflowType {
    Borrow,
    Renew,
    Return,
}

impl WorkflowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Borrow => "BORROW",
            Self::Renew => "RENEW",
            Self::Return => "RETURN",
        }
    }
}

impl fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BORROW" => Ok(Self::Borrow),
            "RENEW" => Ok(Self::Renew),
            "RETURN" => Ok(Self::Return),
            other => Err(other.to_string()),
        }
    }
}

/// Status of a loan, stored by its short code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    #[serde(rename = "R")]
    Requested,
    #[serde(rename = "C")]
    Confirmed,
    #[serde(rename = "KC")]
    KeeperConfirmed,
    #[serde(rename = "D")]
    Delivered,
    #[serde(rename = "RR")]
    RenewRequested,
    #[serde(rename = "RC")]
    RenewConfirmed,
    #[serde(rename = "RTR")]
    ReturnRequested,
    #[serde(rename = "RTC")]
    ReturnConfirmed,
    #[serde(rename = "RT")]
    Returned,
}

impl Status {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Requested => "R",
            Self::Confirmed => "C",
            Self::KeeperConfirmed => "KC",
            Self::Delivered => "D",
            Self::RenewRequested => "RR",
            Self::RenewConfirmed => "RC",
            Self::ReturnRequested => "RTR",
            Self::ReturnConfirmed => "RTC",
            Self::Returned => "RT",
        }
    }

    /// No further step follows.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Returned)
    }

    /// A pending request may still be withdrawn (or a finished one removed).
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            Self::Requested | Self::Confirmed | Self::KeeperConfirmed | Self::Returned
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TRANSITIONS
            .iter()
            .map(|t| t.status)
            .find(|status| status.code() == s)
            .ok_or_else(|| s.to_string())
    }
}

/// Participant role in a loan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    /// The shared copy holding every relation.
    Master,
    Borrower,
    Libworker,
    Keeper,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Master => "MASTER",
            Self::Borrower => "BORROWER",
            Self::Libworker => "LIBWORKER",
            Self::Keeper => "KEEPER",
        }
    }

    /// Participants whose identity a document serving this role carries.
    ///
    /// Borrowers and keepers never learn who the other side is; the library
    /// worker and the MASTER see everyone.
    pub fn sees(&self) -> &'static [Role] {
        match self {
            Self::Master | Self::Libworker => &[Role::Borrower, Role::Libworker, Role::Keeper],
            Self::Borrower => &[Role::Borrower, Role::Libworker],
            Self::Keeper => &[Role::Libworker, Role::Keeper],
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Date slot stamped when a status is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateField {
    Request,
    Confirm,
    KeeperConfirm,
    Delivery,
    RenewRequest,
    RenewConfirm,
    ReturnRequest,
    ReturnConfirm,
    Return,
}

/// Side effect of reaching a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    None,
    /// Refuse unless a copy is on the shelf.
    RequireStock,
    /// Take a copy off the shelf for hand-over.
    StockToTransmitOut,
    TransmitOutToLending,
    /// Refuse past the renew limit.
    CheckRenewLimit,
    CountRenewal,
    LendingToTransmitIn,
    /// Put the copy back on the shelf.
    TransmitInToStock,
}

impl Effect {
    /// The state a copy leaves and the one it enters.
    pub fn movement(&self) -> Option<(CopyStatus, CopyStatus)> {
        match self {
            Self::StockToTransmitOut => Some((CopyStatus::InStock, CopyStatus::TransmitOut)),
            Self::TransmitOutToLending => Some((CopyStatus::TransmitOut, CopyStatus::Lending)),
            Self::LendingToTransmitIn => Some((CopyStatus::Lending, CopyStatus::TransmitIn)),
            Self::TransmitInToStock => Some((CopyStatus::TransmitIn, CopyStatus::InStock)),
            Self::None | Self::RequireStock | Self::CheckRenewLimit | Self::CountRenewal => None,
        }
    }

    /// Whether the book's inventory changes.
    pub fn moves_inventory(&self) -> bool {
        self.movement().is_some()
    }
}

const ALL_ROLES: &[Role] = &[Role::Master, Role::Borrower, Role::Libworker, Role::Keeper];
const RENEW_ROLES: &[Role] = &[Role::Master, Role::Borrower, Role::Libworker];

/// One row of the transition table, which is also one step of the template.
#[derive(Debug, Clone, Copy)]
pub struct Transition {
    pub workflow: WorkflowType,
    pub status: Status,
    /// Role expected to act. Informative only.
    pub actor: Role,
    pub date: DateField,
    /// Roles who see the request at this step.
    pub visible: &'static [Role],
    pub effect: Effect,
    /// Indices of the steps that may follow.
    pub next: &'static [usize],
}

/// The loan graph, indexed by step.
pub const TRANSITIONS: [Transition; 9] = [
    Transition {
        workflow: WorkflowType::Borrow,
        status: Status::Requested,
        actor: Role::Borrower,
        date: DateField::Request,
        visible: ALL_ROLES,
        effect: Effect::None,
        next: &[1],
    },
    Transition {
        workflow: WorkflowType::Borrow,
        status: Status::Confirmed,
        actor: Role::Libworker,
        date: DateField::Confirm,
        visible: ALL_ROLES,
        effect: Effect::RequireStock,
        next: &[2],
    },
    Transition {
        workflow: WorkflowType::Borrow,
        status: Status::KeeperConfirmed,
        actor: Role::Keeper,
        date: DateField::KeeperConfirm,
        visible: ALL_ROLES,
        effect: Effect::StockToTransmitOut,
        next: &[3],
    },
    Transition {
        workflow: WorkflowType::Borrow,
        status: Status::Delivered,
        actor: Role::Borrower,
        date: DateField::Delivery,
        visible: ALL_ROLES,
        effect: Effect::TransmitOutToLending,
        next: &[4, 6],
    },
    Transition {
        workflow: WorkflowType::Renew,
        status: Status::RenewRequested,
        actor: Role::Borrower,
        date: DateField::RenewRequest,
        visible: RENEW_ROLES,
        effect: Effect::CheckRenewLimit,
        next: &[5],
    },
    Transition {
        workflow: WorkflowType::Renew,
        status: Status::RenewConfirmed,
        actor: Role::Libworker,
        date: DateField::RenewConfirm,
        visible: RENEW_ROLES,
        effect: Effect::CountRenewal,
        next: &[4, 6],
    },
    Transition {
        workflow: WorkflowType::Return,
        status: Status::ReturnRequested,
        actor: Role::Borrower,
        date: DateField::ReturnRequest,
        visible: ALL_ROLES,
        effect: Effect::None,
        next: &[7],
    },
    Transition {
        workflow: WorkflowType::Return,
        status: Status::ReturnConfirmed,
        actor: Role::Keeper,
        date: DateField::ReturnConfirm,
        visible: ALL_ROLES,
        effect: Effect::LendingToTransmitIn,
        next: &[8],
    },
    Transition {
        workflow: WorkflowType::Return,
        status: Status::Returned,
        actor: Role::Keeper,
        date: DateField::Return,
        visible: ALL_ROLES,
        effect: Effect::TransmitInToStock,
        next: &[],
    },
];

/// Find the step for `(workflow, status)`.
///
/// The request status `R` is not a valid target: a loan is only ever
/// created there.
pub fn lookup(workflow: WorkflowType, status: Status) -> Option<(usize, &'static Transition)> {
    TRANSITIONS
        .iter()
        .enumerate()
        .skip(1)
        .find(|(_, t)| t.workflow == workflow && t.status == status)
}

/// One node of a request's workflow graph, as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub workflow_type: WorkflowType,
    pub status: Status,
    pub actor_role: Role,
    pub completed: bool,

    /// When the step was completed (epoch millis), 0 if not.
    pub action_date: u64,

    pub next_step_index: Vec<usize>,
    pub related_roles: Vec<Role>,

    /// Step the request was at when this one was reached.
    #[serde(default)]
    pub last_actual_step_index: usize,
}

impl Step {
    pub fn is_visible_to(&self, role: Role) -> bool {
        self.related_roles.contains(&role)
    }
}

/// Fresh workflow graph. The first step is completed at `now`.
pub fn template(now: u64) -> Vec<Step> {
    TRANSITIONS
        .iter()
        .enumerate()
        .map(|(i, t)| Step {
            workflow_type: t.workflow,
            status: t.status,
            actor_role: t.actor,
            completed: i == 0,
            action_date: if i == 0 { now } else { 0 },
            next_step_index: t.next.to_vec(),
            related_roles: t.visible.to_vec(),
            last_actual_step_index: 0,
        })
        .collect()
}
