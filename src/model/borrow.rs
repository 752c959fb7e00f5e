//! Borrow requests.
//!
//! One loan is stored as several copies of a [`BorrowRequest`]: the full
//! MASTER copy in the shared workflow channel and one copy in each
//! participant's inbox, cut down to what that participant may see. Each copy
//! is wrapped in a [`Borrow`] envelope naming the roles it serves and the
//! sibling records it links to.

use serde::{Deserialize, Serialize};

use super::tags::{self, tag};
use super::workflow::{DateField, Role, Status, Step, WorkflowType};

/// Time each status was reached (epoch millis, 0 if not yet).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Dates {
    pub request: u64,
    pub confirm: u64,
    pub keeper_confirm: u64,
    pub delivery: u64,
    pub renew_request: u64,
    pub renew_confirm: u64,
    pub return_request: u64,
    pub return_confirm: u64,
    #[serde(rename = "return")]
    pub returned: u64,
}

impl Dates {
    pub fn stamp(&mut self, field: DateField, at: u64) {
        let slot = match field {
            DateField::Request => &mut self.request,
            DateField::Confirm => &mut self.confirm,
            DateField::KeeperConfirm => &mut self.keeper_confirm,
            DateField::Delivery => &mut self.delivery,
            DateField::RenewRequest => &mut self.renew_request,
            DateField::RenewConfirm => &mut self.renew_confirm,
            DateField::ReturnRequest => &mut self.return_request,
            DateField::ReturnConfirm => &mut self.return_confirm,
            DateField::Return => &mut self.returned,
        };
        *slot = at;
    }
}

/// One logical loan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BorrowRequest {
    /// Public record id of the book.
    pub book_post_id: String,
    pub book_id: String,
    pub book_name: String,
    pub author: String,

    pub borrower_user: String,
    pub borrower_name: String,
    pub libworker_user: String,
    pub libworker_name: String,

    #[serde(default)]
    pub keeper_users: Vec<String>,
    #[serde(default)]
    pub keeper_names: Vec<String>,

    #[serde(default)]
    pub tags: Vec<String>,

    pub workflow: Vec<Step>,
    pub step_index: usize,
    pub last_step_index: usize,

    #[serde(default)]
    pub renewed_times: u32,

    /// Copy handed over at keeper confirmation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chosen_copy_id: Option<String>,

    /// Shared by every copy of this loan.
    pub match_id: String,

    #[serde(default)]
    pub dates: Dates,
}

impl BorrowRequest {
    pub fn current_step(&self) -> Option<&Step> {
        self.workflow.get(self.step_index)
    }

    pub fn status(&self) -> Option<Status> {
        self.current_step().map(|s| s.status)
    }

    pub fn workflow_type(&self) -> Option<WorkflowType> {
        self.current_step().map(|s| s.workflow_type)
    }

    /// Roles `user` holds in this loan.
    pub fn roles_of(&self, user: &str) -> Vec<Role> {
        let mut roles = Vec::new();
        if self.borrower_user == user {
            roles.push(Role::Borrower);
        }
        if self.libworker_user == user {
            roles.push(Role::Libworker);
        }
        if self.keeper_users.iter().any(|k| k == user) {
            roles.push(Role::Keeper);
        }
        roles
    }

    /// Distinct participants with their roles: borrower, then library
    /// worker, then keepers in book order.
    pub fn recipients(&self) -> Vec<(String, Vec<Role>)> {
        let mut out: Vec<(String, Vec<Role>)> = Vec::new();
        let users = std::iter::once(&self.borrower_user)
            .chain(std::iter::once(&self.libworker_user))
            .chain(self.keeper_users.iter());

        for user in users {
            if out.iter().any(|(seen, _)| seen == user) {
                continue;
            }
            out.push((user.clone(), self.roles_of(user)));
        }
        out
    }

    /// Participant, status and copy tags of a document that sees the
    /// participants in `visible`.
    fn tags_for(&self, visible: &[Role]) -> Vec<String> {
        let mut out = Vec::new();
        if visible.contains(&Role::Borrower) {
            out.push(tag(tags::BORROWER, &self.borrower_user));
        }
        if visible.contains(&Role::Libworker) {
            out.push(tag(tags::LIBWORKER, &self.libworker_user));
        }
        if visible.contains(&Role::Keeper) {
            for keeper in &self.keeper_users {
                out.push(tag(tags::KEEPER, keeper));
            }
        }
        if let Some(status) = self.status() {
            out.push(tag(tags::STATUS, status.code()));
        }
        if let Some(copy) = &self.chosen_copy_id {
            out.push(tag(tags::COPY, copy));
        }
        out
    }

    /// Rebuild the full tag set carried by the MASTER.
    pub fn retag(&mut self) {
        self.tags = self.tags_for(Role::Master.sees());
    }

    /// This request as stored in a document serving `roles`.
    ///
    /// Identities none of the roles may see are blanked and left out of the
    /// tags. A document serving several roles sees what any of them sees.
    pub fn view_for(&self, roles: &[Role]) -> BorrowRequest {
        let mut visible: Vec<Role> = roles.iter().flat_map(|r| r.sees().iter().copied()).collect();
        visible.sort();
        visible.dedup();

        let mut view = self.clone();
        view.tags = self.tags_for(&visible);
        if !visible.contains(&Role::Borrower) {
            view.borrower_user.clear();
            view.borrower_name.clear();
        }
        if !visible.contains(&Role::Keeper) {
            view.keeper_users.clear();
            view.keeper_names.clear();
        }
        view
    }
}

/// Links between the copies of one loan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationKeys {
    /// Public record id of the book.
    pub book: String,

    /// Set on satellites.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master: Option<String>,

    /// Set on the master.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub borrower: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub libworker: Option<String>,

    /// Sorted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keepers: Vec<String>,
}

impl RelationKeys {
    /// Point the master's role slots at satellite `id` serving `roles`.
    pub fn link(&mut self, id: &str, roles: &[Role]) {
        if roles.contains(&Role::Borrower) {
            self.borrower = Some(id.to_string());
        }
        if roles.contains(&Role::Libworker) {
            self.libworker = Some(id.to_string());
        }
        if roles.contains(&Role::Keeper) {
            self.keepers.push(id.to_string());
            self.keepers.sort();
        }
    }

    /// Drop every satellite link.
    pub fn unlink_all(&mut self) {
        self.borrower = None;
        self.libworker = None;
        self.keepers.clear();
    }

    /// Every distinct satellite id referenced by a master.
    pub fn satellites(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        let all = self
            .borrower
            .iter()
            .chain(self.libworker.iter())
            .chain(self.keepers.iter());
        for id in all {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        ids
    }
}

/// One stored copy of a loan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Borrow {
    pub request: BorrowRequest,

    /// Roles this copy serves.
    pub roles: Vec<Role>,

    pub relation_keys: RelationKeys,
}

impl Borrow {
    pub fn is_master(&self) -> bool {
        self.roles.contains(&Role::Master)
    }

    /// Whether any of this copy's roles see the current step.
    pub fn sees_current_step(&self) -> bool {
        self.request
            .current_step()
            .is_some_and(|step| self.roles.iter().any(|r| step.is_visible_to(*r)))
    }
}
