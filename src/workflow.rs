//! Workflow state machine.
//!
//! Moves a loan from one status to the next, or back to the status it came
//! from. The MASTER document is the source of truth: the new state is
//! computed on it, applied to the book's inventory where the status calls
//! for it, and copied into every participant document as that participant's
//! view. All writes share one compensation log.
//!
//! Reserving a copy narrows the loan to the keeper holding it and deletes
//! the other keepers' documents. Stepping back over the reservation brings
//! them back.
//!
//! The statuses, their successors and their side effects all come from
//! [`TRANSITIONS`](crate::model::TRANSITIONS); nothing here switches on a
//! status by name.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::books::{BookManager, StoredBook};
use crate::compensation::Compensation;
use crate::error::{LendingError, Result, ValidationError};
use crate::lock::{KeyedLock, LockSet};
use crate::model::workflow::lookup;
use crate::model::{
    now_millis, Book, Borrow, BorrowRequest, CopyStatus, Effect, RelationKeys, Role, Status, Step,
    WorkflowType, TRANSITIONS,
};
use crate::store::{render, Partition, Record, RecordStore, StoreError};

/// Request to move a loan to a new status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRequest {
    pub master_id: String,
    pub act_user: String,
    pub workflow: WorkflowType,
    pub status: Status,

    /// Copy handed over at keeper confirmation. Required when the book
    /// tracks its copies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chosen_copy_id: Option<String>,

    /// Go back to `status`, which must be the status the loan came from.
    /// The current status's effect is undone.
    #[serde(default)]
    pub backward: bool,
}

/// Result of a committed transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub master_id: String,
    pub status: Status,
    pub step_index: usize,

    /// Documents and book parts written.
    pub written: usize,

    /// Threads notified, the MASTER's included.
    pub notified: usize,

    /// Notifications that could not be posted. The transition stands.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notify_failures: Vec<String>,
}

/// Result of a cancelled loan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelOutcome {
    pub master_id: String,
    pub deleted: usize,
}

/// Status notice posted under a loan document.
#[derive(Debug, Serialize)]
struct Notification<'a> {
    root_id: &'a str,
    message: String,
}

/// One loaded copy of a loan.
struct Participant {
    record: Record,
    borrow: Borrow,
}

impl Participant {
    fn from_record(record: Record) -> std::result::Result<Self, StoreError> {
        Ok(Self {
            borrow: record.parse()?,
            record,
        })
    }

    fn id(&self) -> &str {
        &self.record.id
    }

    /// Inbox owner of a satellite.
    fn user(&self) -> Option<&str> {
        match &self.record.partition {
            Partition::Inbox(user) => Some(user),
            _ => None,
        }
    }
}

/// Satellites matched against the participants a request names.
struct Membership {
    kept: Vec<Participant>,
    added: Vec<(String, Vec<Role>)>,
    dropped: Vec<Participant>,
}

impl Membership {
    /// Give every kept satellite its view of `request`.
    fn plan(request: &BorrowRequest, satellites: Vec<Participant>) -> Self {
        let wanted = request.recipients();
        let mut kept: Vec<Participant> = Vec::new();
        let mut dropped = Vec::new();

        for mut doc in satellites {
            let roles = doc
                .user()
                .and_then(|user| wanted.iter().find(|(w, _)| w == user))
                .map(|(_, roles)| roles.clone());
            match roles {
                Some(roles) => {
                    doc.borrow.request = request.view_for(&roles);
                    doc.borrow.roles = roles;
                    kept.push(doc);
                }
                None => dropped.push(doc),
            }
        }

        let added = wanted
            .into_iter()
            .filter(|(user, _)| !kept.iter().any(|d| d.user() == Some(user.as_str())))
            .collect();

        Self { kept, added, dropped }
    }
}

/// Advances and cancels loans.
pub struct WorkflowEngine {
    store: Arc<dyn RecordStore>,
    locks: Arc<dyn KeyedLock>,
    books: Arc<BookManager>,
    max_renew_times: u32,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<dyn RecordStore>,
        locks: Arc<dyn KeyedLock>,
        books: Arc<BookManager>,
        max_renew_times: u32,
    ) -> Self {
        Self {
            store,
            locks,
            books,
            max_renew_times,
        }
    }

    /// Move the loan rooted at `req.master_id` to `(req.workflow, req.status)`.
    pub async fn transition(&self, req: WorkflowRequest) -> Result<TransitionOutcome> {
        let (index, row) = lookup(req.workflow, req.status).ok_or_else(|| ValidationError::UnknownTransition {
            workflow: req.workflow.to_string(),
            status: req.status.to_string(),
        })?;

        let mut guard = LockSet::new(self.locks.clone());
        let (mut master, satellites) = self.load(&req.master_id, &mut guard, false).await?;

        let from = master.borrow.request.step_index;
        let current = master
            .borrow
            .request
            .current_step()
            .ok_or_else(|| ValidationError::Invalid(format!("step index {} out of range", from)))?;
        let from_row = TRANSITIONS
            .get(from)
            .ok_or_else(|| ValidationError::Invalid(format!("step index {} out of range", from)))?;
        let from_status = current.status;

        if req.backward {
            if current.last_actual_step_index != index {
                let expected = TRANSITIONS
                    .get(current.last_actual_step_index)
                    .map(|t| t.status.to_string())
                    .unwrap_or_default();
                return Err(ValidationError::InvalidBackward {
                    expected,
                    requested: req.status.to_string(),
                }
                .into());
            }
        } else if !current.next_step_index.contains(&index) {
            return Err(ValidationError::InvalidTransition {
                from: current.status.to_string(),
                to: req.status.to_string(),
            }
            .into());
        }

        // Forward applies the target's effect, backward undoes the current one
        let effect = if req.backward { from_row.effect } else { row.effect };

        let request = &mut master.borrow.request;
        match effect {
            Effect::CheckRenewLimit if !req.backward && request.renewed_times >= self.max_renew_times => {
                return Err(ValidationError::RenewLimited(request.renewed_times).into());
            }
            Effect::CountRenewal if req.backward => {
                request.renewed_times = request.renewed_times.saturating_sub(1);
            }
            Effect::CountRenewal => request.renewed_times += 1,
            _ => {}
        }

        let needs_book = effect.moves_inventory() || (effect == Effect::RequireStock && !req.backward);
        let book = if needs_book {
            let book_id = master.borrow.relation_keys.book.clone();
            guard.acquire(&book_id)?;
            let stored = self.books.load(&book_id).await?;
            let mut next = stored.book.clone();
            let request = &mut master.borrow.request;
            if req.backward {
                step_back(effect, &mut next, request)?;
            } else {
                step_forward(effect, &mut next, request, req.chosen_copy_id.as_deref())?;
            }
            Some((stored, next))
        } else {
            None
        };

        let request = &mut master.borrow.request;
        let now = now_millis();
        if req.backward {
            let left = request
                .workflow
                .get_mut(from)
                .ok_or_else(|| ValidationError::Invalid(format!("step index {} out of range", from)))?;
            left.completed = false;
            left.action_date = 0;
            request.dates.stamp(from_row.date, 0);
        } else {
            let step = request
                .workflow
                .get_mut(index)
                .ok_or_else(|| ValidationError::Invalid(format!("step index {} out of range", index)))?;
            step.completed = true;
            step.action_date = now;
            step.last_actual_step_index = from;
            request.dates.stamp(row.date, now);
        }
        clear_following(&mut request.workflow, index);
        request.last_step_index = from;
        request.step_index = index;
        request.retag();

        let membership = Membership::plan(&master.borrow.request, satellites);
        if !membership.added.is_empty() || !membership.dropped.is_empty() {
            debug!(
                master_id = %req.master_id,
                added = membership.added.len(),
                dropped = membership.dropped.len(),
                "Loan participants changed"
            );
        }

        let mut log = Compensation::new(self.store.as_ref());
        let saved = self.save(&mut master, membership, book.as_ref(), &mut log).await;
        let (written, participants) = match saved {
            Ok(saved) => {
                log.commit();
                saved
            }
            Err(e) => {
                warn!(master_id = %req.master_id, status = %req.status, error = %e, "Transition save failed, reverting");
                return Err(log
                    .abort(format!("moving {} to {}", req.master_id, req.status), e)
                    .await);
            }
        };

        info!(
            master_id = %req.master_id,
            act_user = %req.act_user,
            from = %from_status,
            to = %row.status,
            backward = req.backward,
            written,
            "Workflow status changed"
        );

        let threads: Vec<&Participant> = std::iter::once(&master).chain(participants.iter()).collect();
        let (notified, notify_failures) = self.notify(&threads, row.status, &req.act_user).await;

        Ok(TransitionOutcome {
            master_id: req.master_id,
            status: row.status,
            step_index: index,
            written,
            notified,
            notify_failures,
        })
    }

    /// Withdraw a loan that has not left the keeper yet, or clear away a
    /// returned one.
    ///
    /// A reserved copy goes back to stock first, together with a MASTER
    /// update that drops the reservation, so a retried cancel never
    /// releases it twice. Satellites are deleted before the MASTER so a
    /// failed cancel can be retried.
    pub async fn cancel(&self, master_id: &str, act_user: &str) -> Result<CancelOutcome> {
        let mut guard = LockSet::new(self.locks.clone());
        let (mut master, satellites) = self.load(master_id, &mut guard, true).await?;

        let request = &master.borrow.request;
        let status = request
            .status()
            .ok_or_else(|| ValidationError::Invalid("loan has no current step".into()))?;
        if !status.is_cancellable() {
            return Err(ValidationError::NotCancellable(status.to_string()).into());
        }

        let reserved = TRANSITIONS
            .get(request.step_index)
            .is_some_and(|t| t.effect == Effect::StockToTransmitOut);
        if reserved {
            let book_id = master.borrow.relation_keys.book.clone();
            guard.acquire(&book_id)?;
            let stored = self.books.load(&book_id).await?;
            let mut next = stored.book.clone();
            step_back(Effect::StockToTransmitOut, &mut next, &mut master.borrow.request)?;
            drop_reservation(&mut master.borrow.request);

            let mut log = Compensation::new(self.store.as_ref());
            if let Err(e) = self.release(&master, &stored, &next, &mut log).await {
                return Err(log
                    .abort(format!("returning reserved copy of {}", book_id), e)
                    .await);
            }
            log.commit();
        }

        let mut deleted = 0;
        for id in satellites.iter().chain(std::iter::once(&master)).map(Participant::id) {
            match self.store.delete(id).await {
                Ok(()) => deleted += 1,
                Err(StoreError::NotFound(_)) => {}
                Err(source) => {
                    return Err(LendingError::Store {
                        context: format!("cancelling {}, retry the cancel", master_id),
                        source,
                    })
                }
            }
        }

        info!(master_id = %master_id, act_user = %act_user, status = %status, deleted, "Cancelled borrow request");
        Ok(CancelOutcome {
            master_id: master_id.to_string(),
            deleted,
        })
    }

    /// Lock and load the MASTER and every document it links to.
    ///
    /// With `tolerate_missing`, satellites that no longer exist are skipped.
    async fn load(
        &self,
        master_id: &str,
        guard: &mut LockSet,
        tolerate_missing: bool,
    ) -> Result<(Participant, Vec<Participant>)> {
        guard.acquire(master_id)?;

        let record = self
            .store
            .get(master_id)
            .await
            .map_err(|e| LendingError::read(format!("loading {}", master_id), e))?;
        let master = Participant::from_record(record)
            .map_err(|e| LendingError::read(format!("reading {}", master_id), e))?;
        if !master.borrow.is_master() {
            return Err(ValidationError::Invalid(format!("{} is not a master document", master_id)).into());
        }

        let ids = master.borrow.relation_keys.satellites();
        guard.acquire_all(ids.iter().map(String::as_str))?;

        let mut satellites = Vec::with_capacity(ids.len());
        for id in &ids {
            match self.store.get(id).await {
                Ok(record) => satellites.push(
                    Participant::from_record(record)
                        .map_err(|e| LendingError::read(format!("reading {}", id), e))?,
                ),
                Err(StoreError::NotFound(_)) if tolerate_missing => {
                    debug!(master_id = %master_id, record_id = %id, "Linked document already gone");
                }
                Err(e) => return Err(LendingError::read(format!("loading {}", id), e)),
            }
        }

        Ok((master, satellites))
    }

    /// Create and delete satellites as `membership` says, relink the
    /// MASTER, then write every changed document and book part.
    ///
    /// Returns the write count and the satellites that exist afterwards.
    async fn save(
        &self,
        master: &mut Participant,
        membership: Membership,
        book: Option<&(StoredBook, Book)>,
        log: &mut Compensation<'_>,
    ) -> std::result::Result<(usize, Vec<Participant>), StoreError> {
        let Membership {
            mut kept,
            added,
            dropped,
        } = membership;
        let mut written = 0;

        for (user, roles) in added {
            let doc = Borrow {
                request: master.borrow.request.view_for(&roles),
                roles,
                relation_keys: RelationKeys {
                    book: master.borrow.relation_keys.book.clone(),
                    master: Some(master.id().to_string()),
                    ..Default::default()
                },
            };
            let partition = Partition::Inbox(user);
            let content = render(&doc)?;
            let id = log.create(&partition, content.clone()).await?;
            written += 1;
            kept.push(Participant {
                record: Record {
                    id,
                    partition,
                    content,
                    created_at: now_millis(),
                },
                borrow: doc,
            });
        }

        for doc in dropped {
            log.delete(doc.record).await?;
            written += 1;
        }

        let keys = &mut master.borrow.relation_keys;
        keys.unlink_all();
        for doc in &kept {
            keys.link(&doc.record.id, &doc.borrow.roles);
        }

        for doc in std::iter::once(&*master).chain(kept.iter()) {
            let content = render(&doc.borrow)?;
            if content != doc.record.content {
                log.update(doc.id(), doc.record.content.clone(), content).await?;
                written += 1;
            }
        }

        if let Some((stored, next)) = book {
            written += stored.save(next, log).await?;
        }

        Ok((written, kept))
    }

    /// Write the MASTER without its reservation and the book with the copy
    /// back in stock.
    async fn release(
        &self,
        master: &Participant,
        stored: &StoredBook,
        next: &Book,
        log: &mut Compensation<'_>,
    ) -> std::result::Result<(), StoreError> {
        log.update(master.id(), master.record.content.clone(), render(&master.borrow)?)
            .await?;
        stored.save(next, log).await?;
        Ok(())
    }

    /// Post the new status under each thread whose document sees it.
    async fn notify(&self, threads: &[&Participant], status: Status, act_user: &str) -> (usize, Vec<String>) {
        let mut notified = 0;
        let mut failures = Vec::new();

        for doc in threads.iter().filter(|d| d.borrow.sees_current_step()) {
            let note = Notification {
                root_id: doc.id(),
                message: format!("Status was changed to {}, by @{}.", status, act_user),
            };
            let posted = match render(&note) {
                Ok(content) => {
                    self.store
                        .create(&Partition::Thread(doc.id().to_string()), content)
                        .await
                }
                Err(e) => Err(e),
            };
            match posted {
                Ok(_) => notified += 1,
                Err(e) => {
                    warn!(record_id = %doc.id(), error = %e, "Failed to notify status change");
                    failures.push(format!("{}: {}", doc.id(), e));
                }
            }
        }

        (notified, failures)
    }
}

/// Apply a status's effect on the way forward.
fn step_forward(effect: Effect, book: &mut Book, request: &mut BorrowRequest, chosen: Option<&str>) -> Result<()> {
    if matches!(effect, Effect::RequireStock | Effect::StockToTransmitOut) && book.inventory.stock <= 0 {
        return Err(ValidationError::NoStock.into());
    }

    if effect == Effect::StockToTransmitOut {
        let keeper = choose_copy(book, chosen)?;
        request.chosen_copy_id = chosen.map(str::to_string);
        if let Some(keeper) = keeper {
            let name = book.private.keeper_name(&keeper).unwrap_or_default().to_string();
            request.keeper_users = vec![keeper];
            request.keeper_names = vec![name];
        }
    }

    match effect.movement() {
        Some((from, to)) => move_copy(book, from, to, request.chosen_copy_id.as_deref()),
        None => Ok(()),
    }
}

/// Undo a status's effect when stepping back over it. Undoing the
/// reservation gives the loan back every keeper of the book.
fn step_back(effect: Effect, book: &mut Book, request: &mut BorrowRequest) -> Result<()> {
    if let Some((from, to)) = effect.movement() {
        move_copy(book, to, from, request.chosen_copy_id.as_deref())?;
    }
    if effect == Effect::StockToTransmitOut {
        request.chosen_copy_id = None;
        request.keeper_users = book.private.keeper_users.clone();
        request.keeper_names = book.private.keeper_names.clone();
    }
    Ok(())
}

/// Put a loan reserved at keeper confirmation back on the step before it.
fn drop_reservation(request: &mut BorrowRequest) {
    let at = request.step_index;
    let back_to = request.current_step().map_or(0, |s| s.last_actual_step_index);
    if let Some(step) = request.workflow.get_mut(at) {
        step.completed = false;
        step.action_date = 0;
    }
    request.last_step_index = at;
    request.step_index = back_to;
    request.retag();
}

/// Check the copy chosen at keeper confirmation and find who keeps it.
///
/// A book that does not track copies accepts any choice and keeps every
/// keeper on the loan.
fn choose_copy(book: &Book, chosen: Option<&str>) -> Result<Option<String>> {
    if !book.inventory.tracks_copies() {
        return Ok(None);
    }

    let copy = chosen.ok_or(ValidationError::NoCopyChosen)?;
    let status = *book
        .inventory
        .copies
        .get(copy)
        .ok_or_else(|| ValidationError::UnknownCopy(copy.to_string()))?;
    if status != CopyStatus::InStock {
        return Err(ValidationError::CopyNotInStock {
            copy: copy.to_string(),
            status,
        }
        .into());
    }

    let Some(keeper) = book.private.copy_keepers.get(copy) else {
        return Ok(None);
    };
    if !book.private.keeper_users.contains(keeper) {
        return Err(ValidationError::UnknownCopyKeeper {
            copy: copy.to_string(),
            keeper: keeper.clone(),
        }
        .into());
    }
    Ok(Some(keeper.clone()))
}

/// Move one copy between inventory states and keep the borrowable flag in
/// step with stock. Fails if a counter would go negative.
fn move_copy(book: &mut Book, from: CopyStatus, to: CopyStatus, copy: Option<&str>) -> Result<()> {
    let inv = &mut book.inventory;
    *inv.count_mut(from) -= 1;
    *inv.count_mut(to) += 1;

    if inv.is_negative() {
        return Err(ValidationError::Invalid(format!(
            "inventory of {} would go negative, counters are out of sync",
            book.public.id
        ))
        .into());
    }

    if let Some(copy) = copy {
        if let Some(slot) = book.inventory.copies.get_mut(copy) {
            if *slot != from {
                return Err(
                    ValidationError::Invalid(format!("copy {} is {}, expected {}", copy, slot, from)).into(),
                );
            }
            *slot = to;
        }
    }

    let stock = book.inventory.stock;
    book.public.reconcile_stock(stock);
    Ok(())
}

/// Reset every step reachable from `target` that does not lie on a path
/// from the first step to `target`.
fn clear_following(workflow: &mut [Step], target: usize) {
    let mut on_path = BTreeSet::new();
    collect_paths(workflow, 0, target, &mut Vec::new(), &mut on_path);

    let mut seen = BTreeSet::new();
    let mut pending = vec![target];
    while let Some(i) = pending.pop() {
        let Some(step) = workflow.get(i) else {
            continue;
        };
        for &next in &step.next_step_index {
            if next < workflow.len() && seen.insert(next) {
                pending.push(next);
            }
        }
    }

    for i in seen.difference(&on_path) {
        let step = &mut workflow[*i];
        step.completed = false;
        step.action_date = 0;
    }
}

fn collect_paths(
    workflow: &[Step],
    from: usize,
    target: usize,
    stack: &mut Vec<usize>,
    on_path: &mut BTreeSet<usize>,
) {
    stack.push(from);
    if from == target {
        on_path.extend(stack.iter().copied());
    } else if let Some(step) = workflow.get(from) {
        for &next in &step.next_step_index {
            if !stack.contains(&next) {
                collect_paths(workflow, next, target, stack, on_path);
            }
        }
    }
    stack.pop();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::borrow::StartedBorrow;
    use crate::error::ErrorKind;
    use crate::model::book::NO_STOCK_REASON;
    use crate::model::BookInventory;
    use crate::model::workflow::template;
    use crate::test_support::{sample_book, tracked_book, Harness};

    struct Loan {
        book_id: String,
        started: StartedBorrow,
    }

    async fn start_loan(h: &Harness, stock: i64) -> Loan {
        let book_id = h.books().create(sample_book("b1", stock)).await.unwrap();
        let started = h.borrow(0).start(&book_id, "bor").await.unwrap();
        Loan { book_id, started }
    }

    fn req(loan: &Loan, workflow: WorkflowType, status: Status) -> WorkflowRequest {
        WorkflowRequest {
            master_id: loan.started.master_id.clone(),
            act_user: "kp1".into(),
            workflow,
            status,
            chosen_copy_id: None,
            backward: false,
        }
    }

    fn back(loan: &Loan, workflow: WorkflowType, status: Status) -> WorkflowRequest {
        WorkflowRequest {
            backward: true,
            ..req(loan, workflow, status)
        }
    }

    fn keep_copy(loan: &Loan, copy: &str) -> WorkflowRequest {
        WorkflowRequest {
            chosen_copy_id: Some(copy.into()),
            ..req(loan, WorkflowType::Borrow, Status::KeeperConfirmed)
        }
    }

    async fn start_tracked_loan(h: &Harness) -> Loan {
        let book_id = h.books().create(tracked_book("b1")).await.unwrap();
        let started = h.borrow(0).start(&book_id, "bor").await.unwrap();
        Loan { book_id, started }
    }

    /// Overwrite the stored inventory behind the engines' back.
    async fn tamper_inventory(h: &Harness, book_id: &str, edit: impl FnOnce(&mut BookInventory)) {
        let stored = h.books().load(book_id).await.unwrap();
        let mut inv = stored.book.inventory.clone();
        edit(&mut inv);
        h.store
            .inner()
            .update(&stored.inventory_id, render(&inv).unwrap())
            .await
            .unwrap();
    }

    async fn load(h: &Harness, id: &str) -> Borrow {
        h.store.inner().get(id).await.unwrap().parse().unwrap()
    }

    async fn advance(h: &Harness, loan: &Loan, path: &[(WorkflowType, Status)]) {
        for (workflow, status) in path {
            h.workflow_engine(2)
                .transition(req(loan, *workflow, *status))
                .await
                .unwrap();
        }
    }

    const TO_DELIVERED: [(WorkflowType, Status); 3] = [
        (WorkflowType::Borrow, Status::Confirmed),
        (WorkflowType::Borrow, Status::KeeperConfirmed),
        (WorkflowType::Borrow, Status::Delivered),
    ];

    #[tokio::test]
    async fn test_confirm_updates_every_document_and_notifies() {
        let h = Harness::new();
        let loan = start_loan(&h, 2).await;

        let outcome = h
            .workflow_engine(2)
            .transition(req(&loan, WorkflowType::Borrow, Status::Confirmed))
            .await
            .unwrap();
        assert_eq!(outcome.step_index, 1);
        assert_eq!(outcome.written, 5);
        assert_eq!(outcome.notified, 5);
        assert!(outcome.notify_failures.is_empty());

        let master = load(&h, &loan.started.master_id).await;
        let step = &master.request.workflow[1];
        assert!(step.completed);
        assert_eq!(master.request.dates.confirm, step.action_date);
        assert!(master.request.dates.confirm > 0);
        assert_eq!(master.request.last_step_index, 0);

        for (user, id) in &loan.started.satellites {
            let doc = load(&h, id).await;
            assert_eq!(doc.request.step_index, 1, "{}", user);
            assert!(doc.request.tags.contains(&"#s_C".to_string()));
            assert!(!doc.request.tags.contains(&"#s_R".to_string()));

            let notes = h.store.inner().records_in(&Partition::Thread(id.clone()));
            assert_eq!(notes.len(), 1);
            assert_eq!(
                notes[0].content["message"],
                "Status was changed to C, by @kp1."
            );
        }
        let notes = h
            .store
            .inner()
            .records_in(&Partition::Thread(loan.started.master_id.clone()));
        assert_eq!(notes.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_transition_writes_nothing() {
        let h = Harness::new();
        let loan = start_loan(&h, 2).await;
        let before = h.store.writes();

        for (workflow, status) in [
            (WorkflowType::Borrow, Status::Requested),
            (WorkflowType::Renew, Status::Confirmed),
            (WorkflowType::Return, Status::Delivered),
        ] {
            let err = h
                .workflow_engine(2)
                .transition(req(&loan, workflow, status))
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                LendingError::Validation(ValidationError::UnknownTransition { .. })
            ));
        }
        assert_eq!(h.store.writes(), before);
    }

    #[tokio::test]
    async fn test_skipping_a_step_is_invalid() {
        let h = Harness::new();
        let loan = start_loan(&h, 2).await;

        let err = h
            .workflow_engine(2)
            .transition(req(&loan, WorkflowType::Borrow, Status::Delivered))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LendingError::Validation(ValidationError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_full_cycle_moves_inventory() {
        let h = Harness::new();
        let loan = start_loan(&h, 1).await;
        let engine = h.workflow_engine(2);
        let inventory = |book: Book| {
            let inv = book.inventory;
            (inv.stock, inv.transmit_out, inv.lending, inv.transmit_in)
        };

        let mut kc = req(&loan, WorkflowType::Borrow, Status::Confirmed);
        engine.transition(kc.clone()).await.unwrap();

        kc.status = Status::KeeperConfirmed;
        kc.chosen_copy_id = Some("copy-1".into());
        engine.transition(kc).await.unwrap();
        let book = h.books().get(&loan.book_id).await.unwrap();
        assert!(!book.public.is_allowed_to_borrow);
        assert_eq!(book.public.reason_of_disallowed, NO_STOCK_REASON);
        assert_eq!(inventory(book), (0, 1, 0, 0));

        let master = load(&h, &loan.started.master_id).await;
        assert_eq!(master.request.chosen_copy_id.as_deref(), Some("copy-1"));
        assert!(master.request.tags.contains(&"#cp_copy-1".to_string()));

        engine
            .transition(req(&loan, WorkflowType::Borrow, Status::Delivered))
            .await
            .unwrap();
        assert_eq!(inventory(h.books().get(&loan.book_id).await.unwrap()), (0, 0, 1, 0));

        engine
            .transition(req(&loan, WorkflowType::Return, Status::ReturnRequested))
            .await
            .unwrap();
        engine
            .transition(req(&loan, WorkflowType::Return, Status::ReturnConfirmed))
            .await
            .unwrap();
        assert_eq!(inventory(h.books().get(&loan.book_id).await.unwrap()), (0, 0, 0, 1));

        engine
            .transition(req(&loan, WorkflowType::Return, Status::Returned))
            .await
            .unwrap();
        let book = h.books().get(&loan.book_id).await.unwrap();
        assert!(book.public.is_allowed_to_borrow);
        assert!(book.public.reason_of_disallowed.is_empty());
        assert_eq!(inventory(book), (1, 0, 0, 0));

        let master = load(&h, &loan.started.master_id).await;
        assert!(master.request.dates.returned > 0);
        assert_eq!(master.request.status(), Some(Status::Returned));
    }

    #[tokio::test]
    async fn test_confirm_requires_stock() {
        let h = Harness::new();
        let loan = start_loan(&h, 1).await;

        // Stock taken by someone else after the request was made
        tamper_inventory(&h, &loan.book_id, |inv| {
            inv.stock = 0;
            inv.lending = 1;
        })
        .await;
        let before = h.store.writes();

        let err = h
            .workflow_engine(2)
            .transition(req(&loan, WorkflowType::Borrow, Status::Confirmed))
            .await
            .unwrap_err();
        assert!(matches!(err, LendingError::Validation(ValidationError::NoStock)));
        assert_eq!(h.store.writes(), before);
    }

    #[tokio::test]
    async fn test_renewal_skips_keepers_and_respects_limit() {
        let h = Harness::new();
        let loan = start_loan(&h, 2).await;
        advance(&h, &loan, &TO_DELIVERED).await;
        let engine = h.workflow_engine(1);

        let outcome = engine
            .transition(req(&loan, WorkflowType::Renew, Status::RenewRequested))
            .await
            .unwrap();
        // Master, borrower and worker
        assert_eq!(outcome.notified, 3);

        let master = load(&h, &loan.started.master_id).await;
        assert!(master.request.tags.contains(&"#k_kp1".to_string()));
        assert!(master.request.tags.contains(&"#s_RR".to_string()));
        let (_, borrower_doc) = &loan.started.satellites[0];
        let borrower = load(&h, borrower_doc).await;
        assert!(!borrower.request.tags.iter().any(|t| t.starts_with("#k_")));
        assert!(borrower.request.keeper_users.is_empty());

        engine
            .transition(req(&loan, WorkflowType::Renew, Status::RenewConfirmed))
            .await
            .unwrap();
        let master = load(&h, &loan.started.master_id).await;
        assert_eq!(master.request.renewed_times, 1);

        let err = engine
            .transition(req(&loan, WorkflowType::Renew, Status::RenewRequested))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LendingError::Validation(ValidationError::RenewLimited(1))
        ));

        engine
            .transition(req(&loan, WorkflowType::Return, Status::ReturnRequested))
            .await
            .unwrap();
        let master = load(&h, &loan.started.master_id).await;
        assert!(master.request.tags.contains(&"#k_kp1".to_string()));
        assert!(master.request.tags.contains(&"#k_kp2".to_string()));
    }

    #[tokio::test]
    async fn test_second_renewal_clears_the_loop() {
        let h = Harness::new();
        let loan = start_loan(&h, 2).await;
        advance(&h, &loan, &TO_DELIVERED).await;
        advance(
            &h,
            &loan,
            &[
                (WorkflowType::Renew, Status::RenewRequested),
                (WorkflowType::Renew, Status::RenewConfirmed),
                (WorkflowType::Renew, Status::RenewRequested),
            ],
        )
        .await;

        let master = load(&h, &loan.started.master_id).await;
        let steps = &master.request.workflow;
        assert!(steps[4].completed);
        assert!(!steps[5].completed);
        assert_eq!(steps[5].action_date, 0);
        assert!(steps[3].completed);
        assert_eq!(steps[4].last_actual_step_index, 5);
    }

    #[tokio::test]
    async fn test_save_failure_restores_documents_and_book() {
        let h = Harness::new();
        let loan = start_loan(&h, 2).await;
        advance(&h, &loan, &TO_DELIVERED[..1]).await;

        let master_before = h.store.inner().get(&loan.started.master_id).await.unwrap();
        let book_before = h.books().get(&loan.book_id).await.unwrap();
        h.store.fail_updates_in(h.inventory());

        let err = h
            .workflow_engine(2)
            .transition(req(&loan, WorkflowType::Borrow, Status::KeeperConfirmed))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PartialWriteFailure);

        assert_eq!(
            h.store.inner().get(&loan.started.master_id).await.unwrap(),
            master_before
        );
        assert_eq!(h.books().get(&loan.book_id).await.unwrap(), book_before);
        for (_, id) in &loan.started.satellites {
            assert_eq!(load(&h, id).await.request.step_index, 1);
        }
    }

    #[tokio::test]
    async fn test_failed_revert_is_fatal() {
        let h = Harness::new();
        let loan = start_loan(&h, 2).await;
        let (_, borrower_doc) = loan.started.satellites[0].clone();
        h.store.fail_update_of(&borrower_doc);
        // The master is written first and its revert is the third write
        h.store.fail_nth_write(3);

        let err = h
            .workflow_engine(2)
            .transition(req(&loan, WorkflowType::Borrow, Status::Confirmed))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FatalInconsistency);
    }

    #[tokio::test]
    async fn test_notification_failure_keeps_transition() {
        let h = Harness::new();
        let loan = start_loan(&h, 2).await;
        let (_, borrower_doc) = loan.started.satellites[0].clone();
        h.store.fail_nth_create_in(Partition::Thread(borrower_doc.clone()), 1);

        let outcome = h
            .workflow_engine(2)
            .transition(req(&loan, WorkflowType::Borrow, Status::Confirmed))
            .await
            .unwrap();
        assert_eq!(outcome.notified, 4);
        assert_eq!(outcome.notify_failures.len(), 1);
        assert_eq!(
            load(&h, &loan.started.master_id).await.request.status(),
            Some(Status::Confirmed)
        );
    }

    #[tokio::test]
    async fn test_locked_participant_is_busy() {
        let h = Harness::new();
        let loan = start_loan(&h, 2).await;
        let (_, keeper_doc) = loan.started.satellites[2].clone();
        assert!(h.locks.try_acquire(&keeper_doc));
        let before = h.store.writes();

        let err = h
            .workflow_engine(2)
            .transition(req(&loan, WorkflowType::Borrow, Status::Confirmed))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockConflict);
        assert_eq!(h.store.writes(), before);
        assert!(!h.locks.is_held(&loan.started.master_id));
    }

    #[tokio::test]
    async fn test_missing_master() {
        let h = Harness::new();
        let err = h
            .workflow_engine(2)
            .transition(WorkflowRequest {
                master_id: "gone".into(),
                act_user: "kp1".into(),
                workflow: WorkflowType::Borrow,
                status: Status::Confirmed,
                chosen_copy_id: None,
                backward: false,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_satellite_is_not_a_master() {
        let h = Harness::new();
        let loan = start_loan(&h, 2).await;
        let mut request = req(&loan, WorkflowType::Borrow, Status::Confirmed);
        request.master_id = loan.started.satellites[0].1.clone();

        let err = h.workflow_engine(2).transition(request).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_cancel_at_keeper_confirmed_restores_stock() {
        let h = Harness::new();
        let loan = start_loan(&h, 1).await;
        advance(&h, &loan, &TO_DELIVERED[..2]).await;
        assert_eq!(h.books().get(&loan.book_id).await.unwrap().inventory.stock, 0);

        let outcome = h
            .workflow_engine(2)
            .cancel(&loan.started.master_id, "bor")
            .await
            .unwrap();
        assert_eq!(outcome.deleted, 5);

        let book = h.books().get(&loan.book_id).await.unwrap();
        assert_eq!(book.inventory.stock, 1);
        assert_eq!(book.inventory.transmit_out, 0);
        assert!(book.public.is_allowed_to_borrow);
        assert!(h.store.inner().records_in(&h.workflow()).is_empty());
    }

    #[tokio::test]
    async fn test_cancel_after_delivery_is_refused() {
        let h = Harness::new();
        let loan = start_loan(&h, 2).await;
        advance(&h, &loan, &TO_DELIVERED).await;

        let err = h
            .workflow_engine(2)
            .cancel(&loan.started.master_id, "bor")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LendingError::Validation(ValidationError::NotCancellable(s)) if s == "D"
        ));
    }

    #[tokio::test]
    async fn test_cancel_deletes_master_last_and_retries() {
        let h = Harness::new();
        let loan = start_loan(&h, 2).await;
        let (_, keeper_doc) = loan.started.satellites[2].clone();
        h.store.fail_delete_of(&keeper_doc);

        let err = h
            .workflow_engine(2)
            .cancel(&loan.started.master_id, "bor")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Store);
        assert!(h.store.inner().contains(&loan.started.master_id));

        h.store.clear_faults();
        let outcome = h
            .workflow_engine(2)
            .cancel(&loan.started.master_id, "bor")
            .await
            .unwrap();
        assert_eq!(outcome.deleted, 3);
        assert!(!h.store.inner().contains(&loan.started.master_id));
    }

    #[tokio::test]
    async fn test_keeper_confirmation_narrows_to_the_copy_keeper() {
        let h = Harness::new();
        let loan = start_tracked_loan(&h).await;
        let (_, kp1_doc) = loan.started.satellites[2].clone();
        let (_, kp2_doc) = loan.started.satellites[3].clone();
        let engine = h.workflow_engine(2);
        advance(&h, &loan, &TO_DELIVERED[..1]).await;

        let outcome = engine.transition(keep_copy(&loan, "cp2")).await.unwrap();
        assert_eq!(outcome.notified, 4);
        assert!(!h.store.inner().contains(&kp1_doc));

        let master = load(&h, &loan.started.master_id).await;
        assert_eq!(master.request.keeper_users, vec!["kp2".to_string()]);
        assert_eq!(master.request.keeper_names, vec!["Keeper2".to_string()]);
        assert_eq!(master.relation_keys.keepers, vec![kp2_doc.clone()]);
        assert!(!master.request.tags.contains(&"#k_kp1".to_string()));
        assert_eq!(load(&h, &kp2_doc).await.request.chosen_copy_id.as_deref(), Some("cp2"));

        let copies = |book: Book| book.inventory.copies;
        let book = h.books().get(&loan.book_id).await.unwrap();
        assert_eq!(book.inventory.stock, 1);
        assert_eq!(copies(book.clone())["cp1"], CopyStatus::InStock);
        assert_eq!(copies(book)["cp2"], CopyStatus::TransmitOut);

        for (workflow, status, expected) in [
            (WorkflowType::Borrow, Status::Delivered, CopyStatus::Lending),
            (WorkflowType::Return, Status::ReturnRequested, CopyStatus::Lending),
            (WorkflowType::Return, Status::ReturnConfirmed, CopyStatus::TransmitIn),
            (WorkflowType::Return, Status::Returned, CopyStatus::InStock),
        ] {
            engine.transition(req(&loan, workflow, status)).await.unwrap();
            let book = h.books().get(&loan.book_id).await.unwrap();
            assert_eq!(copies(book)["cp2"], expected, "{}", status);
        }
        let book = h.books().get(&loan.book_id).await.unwrap();
        assert_eq!(book.inventory.stock, 2);
    }

    #[tokio::test]
    async fn test_keeper_confirmation_checks_the_copy() {
        let h = Harness::new();
        let loan = start_tracked_loan(&h).await;
        advance(&h, &loan, &TO_DELIVERED[..1]).await;
        tamper_inventory(&h, &loan.book_id, |inv| {
            inv.copies.insert("cp1".into(), CopyStatus::Lending);
        })
        .await;
        let before = h.store.writes();
        let engine = h.workflow_engine(2);

        let err = engine
            .transition(req(&loan, WorkflowType::Borrow, Status::KeeperConfirmed))
            .await
            .unwrap_err();
        assert!(matches!(err, LendingError::Validation(ValidationError::NoCopyChosen)));

        let err = engine.transition(keep_copy(&loan, "cp9")).await.unwrap_err();
        assert!(matches!(
            err,
            LendingError::Validation(ValidationError::UnknownCopy(c)) if c == "cp9"
        ));

        let err = engine.transition(keep_copy(&loan, "cp1")).await.unwrap_err();
        assert!(matches!(
            err,
            LendingError::Validation(ValidationError::CopyNotInStock { status: CopyStatus::Lending, .. })
        ));

        assert_eq!(h.store.writes(), before);
        let master = load(&h, &loan.started.master_id).await;
        assert_eq!(master.request.status(), Some(Status::Confirmed));
    }

    #[tokio::test]
    async fn test_step_back_from_keeper_confirmation_restores_keepers() {
        let h = Harness::new();
        let loan = start_tracked_loan(&h).await;
        let engine = h.workflow_engine(2);
        advance(&h, &loan, &TO_DELIVERED[..1]).await;
        engine.transition(keep_copy(&loan, "cp2")).await.unwrap();

        let outcome = engine
            .transition(back(&loan, WorkflowType::Borrow, Status::Confirmed))
            .await
            .unwrap();
        assert_eq!(outcome.step_index, 1);

        let master = load(&h, &loan.started.master_id).await;
        assert_eq!(master.request.step_index, 1);
        assert_eq!(master.request.last_step_index, 2);
        assert_eq!(master.request.chosen_copy_id, None);
        assert_eq!(master.request.keeper_users, vec!["kp1".to_string(), "kp2".to_string()]);
        assert_eq!(master.relation_keys.keepers.len(), 2);
        assert!(!master.request.workflow[2].completed);
        assert_eq!(master.request.dates.keeper_confirm, 0);
        assert!(master.request.tags.contains(&"#s_C".to_string()));

        // kp1 gets a fresh document
        let kp1_docs = h.store.inner().records_in(&Partition::Inbox("kp1".into()));
        assert_eq!(kp1_docs.len(), 1);
        assert!(master.relation_keys.keepers.contains(&kp1_docs[0].id));

        let book = h.books().get(&loan.book_id).await.unwrap();
        assert_eq!(book.inventory.stock, 2);
        assert_eq!(book.inventory.transmit_out, 0);
        assert_eq!(book.inventory.copies["cp2"], CopyStatus::InStock);

        // The other copy can be chosen now
        engine.transition(keep_copy(&loan, "cp1")).await.unwrap();
        let master = load(&h, &loan.started.master_id).await;
        assert_eq!(master.request.keeper_users, vec!["kp1".to_string()]);
    }

    #[tokio::test]
    async fn test_step_back_only_to_the_previous_status() {
        let h = Harness::new();
        let loan = start_loan(&h, 2).await;
        advance(&h, &loan, &TO_DELIVERED).await;
        let before = h.store.writes();

        let err = h
            .workflow_engine(2)
            .transition(back(&loan, WorkflowType::Borrow, Status::Confirmed))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LendingError::Validation(ValidationError::InvalidBackward { expected, requested })
                if expected == "KC" && requested == "C"
        ));
        assert_eq!(h.store.writes(), before);
    }

    #[tokio::test]
    async fn test_step_back_over_renewal_gives_it_back() {
        let h = Harness::new();
        let loan = start_loan(&h, 2).await;
        advance(&h, &loan, &TO_DELIVERED).await;
        advance(
            &h,
            &loan,
            &[
                (WorkflowType::Renew, Status::RenewRequested),
                (WorkflowType::Renew, Status::RenewConfirmed),
            ],
        )
        .await;
        assert_eq!(load(&h, &loan.started.master_id).await.request.renewed_times, 1);

        h.workflow_engine(2)
            .transition(back(&loan, WorkflowType::Renew, Status::RenewRequested))
            .await
            .unwrap();
        let master = load(&h, &loan.started.master_id).await;
        assert_eq!(master.request.renewed_times, 0);
        assert_eq!(master.request.status(), Some(Status::RenewRequested));
        assert_eq!(master.request.dates.renew_confirm, 0);
    }

    #[tokio::test]
    async fn test_failed_narrowing_brings_the_keeper_back() {
        let h = Harness::new();
        let loan = start_tracked_loan(&h).await;
        let (_, kp1_doc) = loan.started.satellites[2].clone();
        advance(&h, &loan, &TO_DELIVERED[..1]).await;
        let kp1_before = h.store.inner().get(&kp1_doc).await.unwrap();
        let master_before = h.store.inner().get(&loan.started.master_id).await.unwrap();
        h.store.fail_updates_in(h.inventory());

        let err = h
            .workflow_engine(2)
            .transition(keep_copy(&loan, "cp2"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PartialWriteFailure);

        assert_eq!(h.store.inner().get(&kp1_doc).await.unwrap(), kp1_before);
        assert_eq!(
            h.store.inner().get(&loan.started.master_id).await.unwrap(),
            master_before
        );
        assert!(h.store.ops().contains(&format!("restore:{}", kp1_doc)));
    }

    #[tokio::test]
    async fn test_cancel_refuses_out_of_sync_inventory() {
        let h = Harness::new();
        let loan = start_loan(&h, 1).await;
        advance(&h, &loan, &TO_DELIVERED[..2]).await;
        tamper_inventory(&h, &loan.book_id, |inv| inv.transmit_out = 0).await;
        let before = h.store.writes();

        let err = h
            .workflow_engine(2)
            .cancel(&loan.started.master_id, "bor")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(h.store.writes(), before);
        assert!(h.store.inner().contains(&loan.started.master_id));
        assert_eq!(h.books().get(&loan.book_id).await.unwrap().inventory.stock, 0);
    }

    #[tokio::test]
    async fn test_cancel_retry_at_keeper_confirmed_releases_once() {
        let h = Harness::new();
        let loan = start_loan(&h, 1).await;
        advance(&h, &loan, &TO_DELIVERED[..2]).await;
        let (_, keeper_doc) = loan.started.satellites[2].clone();
        h.store.fail_delete_of(&keeper_doc);

        let err = h
            .workflow_engine(2)
            .cancel(&loan.started.master_id, "bor")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Store);
        let master = load(&h, &loan.started.master_id).await;
        assert_eq!(master.request.status(), Some(Status::Confirmed));
        assert_eq!(h.books().get(&loan.book_id).await.unwrap().inventory.stock, 1);

        h.store.clear_faults();
        let outcome = h
            .workflow_engine(2)
            .cancel(&loan.started.master_id, "bor")
            .await
            .unwrap();
        assert_eq!(outcome.deleted, 3);

        let book = h.books().get(&loan.book_id).await.unwrap();
        assert_eq!(book.inventory.stock, 1);
        assert_eq!(book.inventory.transmit_out, 0);
    }

    #[test]
    fn test_clear_following_keeps_the_path() {
        let mut steps = template(1);
        for step in steps.iter_mut().take(7) {
            step.completed = true;
            step.action_date = 5;
        }

        clear_following(&mut steps, 4);

        for i in 0..=4 {
            assert!(steps[i].completed, "step {}", i);
        }
        for i in 5..=6 {
            assert!(!steps[i].completed, "step {}", i);
            assert_eq!(steps[i].action_date, 0);
        }
        assert_eq!(steps[0].related_roles[0], Role::Master);
    }
}
