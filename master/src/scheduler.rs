//! Loop de despacho: avanza requests en vuelo stage por stage.
//!
//! Cada pasada lee el estado persistido, decide y escribe antes de hablar con
//! los agentes. Un master que reinicia retoma desde el store sin estado propio.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use common::{
    AgentCommand, CommandReport, HostName, HostRoleCommand, HostRoleStatus, InvalidTransition,
    ReportStatus, Request, RequestId, RequestStatus, Stage,
};

use crate::config::SchedulerSettings;
use crate::db::{ActionDbAccessor, PersistenceError, RequestView, TaskStatusUpdate};
use crate::dispatch::{AgentDispatcher, ReportQueue};
use crate::retry_policy::{RetryDecision, TaskRetryPolicy};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Transition(#[from] InvalidTransition),
}

/// Lo que hizo una pasada. Sirve para logs y tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkSummary {
    pub requests_seen: usize,
    pub dispatched: usize,
    pub dispatch_failures: usize,
    pub timed_out: usize,
    pub retried: usize,
    pub failed: usize,
    pub aborted: usize,
    pub reports_applied: usize,
    pub reports_ignored: usize,
    pub request_errors: usize,
}

/// Cupos de tareas IN_PROGRESS por host y en total.
#[derive(Debug)]
struct HostSlots {
    per_host: usize,
    total: usize,
    by_host: HashMap<HostName, usize>,
    in_flight: usize,
}

impl HostSlots {
    fn new(per_host: usize, total: usize) -> Self {
        HostSlots {
            per_host,
            total,
            by_host: HashMap::new(),
            in_flight: 0,
        }
    }

    fn occupy(&mut self, host: &str) {
        *self.by_host.entry(host.to_string()).or_default() += 1;
        self.in_flight += 1;
    }

    fn release(&mut self, host: &str) {
        if let Some(n) = self.by_host.get_mut(host) {
            *n = n.saturating_sub(1);
        }
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    fn host_full(&self, host: &str) -> bool {
        self.by_host.get(host).copied().unwrap_or(0) >= self.per_host
    }

    fn global_full(&self) -> bool {
        self.in_flight >= self.total
    }
}

pub struct ActionScheduler {
    db: Arc<dyn ActionDbAccessor>,
    dispatcher: Arc<dyn AgentDispatcher>,
    reports: ReportQueue,
    retry: TaskRetryPolicy,
    settings: SchedulerSettings,
    // último estado visto por request, sólo para loguear transiciones
    last_status: Mutex<HashMap<RequestId, RequestStatus>>,
    // despachos rechazados cuya vuelta atrás no se pudo persistir
    pending_reverts: Mutex<Vec<HostRoleCommand>>,
}

impl ActionScheduler {
    pub fn new(
        db: Arc<dyn ActionDbAccessor>,
        dispatcher: Arc<dyn AgentDispatcher>,
        reports: ReportQueue,
        settings: SchedulerSettings,
    ) -> Self {
        ActionScheduler {
            db,
            dispatcher,
            reports,
            retry: TaskRetryPolicy::new(settings.max_attempts),
            settings,
            last_status: Mutex::new(HashMap::new()),
            pending_reverts: Mutex::new(Vec::new()),
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub fn do_work(&self) -> Result<WorkSummary, PersistenceError> {
        self.do_work_at(Utc::now())
    }

    /// Una pasada completa con un reloj explícito.
    pub fn do_work_at(&self, now: DateTime<Utc>) -> Result<WorkSummary, PersistenceError> {
        let mut summary = WorkSummary::default();
        self.flush_reverts();

        let mut views = Vec::new();
        for request in self.db.get_in_flight_requests()? {
            let request_id = request.request_id;
            match RequestView::load(self.db.as_ref(), request) {
                Ok(view) => views.push(view),
                Err(e) => {
                    warn!("no se pudo cargar el request {}: {}", request_id, e);
                    summary.request_errors += 1;
                }
            }
        }
        summary.requests_seen = views.len();

        let mut slots = HostSlots::new(
            self.settings.max_in_flight_per_host,
            self.settings.max_in_flight_total,
        );
        for task in views.iter().flat_map(|v| v.tasks()) {
            if task.status == HostRoleStatus::InProgress {
                slots.occupy(&task.host_name);
            }
        }

        for view in &mut views {
            let request_id = view.request.request_id;
            if let Err(e) = self.process_request(view, &mut slots, now, &mut summary) {
                // el estado persistido sigue siendo válido; se reintenta en la próxima pasada
                warn!("error procesando el request {}: {}", request_id, e);
                summary.request_errors += 1;
            }
        }

        self.consume_reports(now, &mut summary);

        let touched: Vec<RequestId> = views.iter().map(|v| v.request.request_id).collect();
        self.log_status_changes(&touched);

        if summary != WorkSummary::default() {
            debug!("pasada del scheduler: {:?}", summary);
        }
        Ok(summary)
    }

    fn process_request(
        &self,
        view: &mut RequestView,
        slots: &mut HostSlots,
        now: DateTime<Utc>,
        summary: &mut WorkSummary,
    ) -> Result<(), SchedulerError> {
        let status = view.status();
        let open = !view.request.abort_requested && status != RequestStatus::Failed;

        if view.request.abort_requested {
            self.abort_unstarted(view, "abort pedido", now, summary)?;
        } else if status == RequestStatus::Failed {
            self.abort_unstarted(view, "el request ya falló", now, summary)?;
        } else if let Some(idx) = view.eligible_stage() {
            self.dispatch_stage(view, idx, slots, now, summary)?;
        }

        self.check_timeouts(view, open, slots, now, summary)
    }

    /// PENDING, QUEUED y TIMEDOUT pasan a ABORTED. IN_PROGRESS sigue hasta su resultado.
    fn abort_unstarted(
        &self,
        view: &mut RequestView,
        reason: &str,
        now: DateTime<Utc>,
        summary: &mut WorkSummary,
    ) -> Result<(), SchedulerError> {
        for task in view.stages.iter_mut().flat_map(|(_, tasks)| tasks.iter_mut()) {
            if !matches!(
                task.status,
                HostRoleStatus::Pending | HostRoleStatus::Queued | HostRoleStatus::TimedOut
            ) {
                continue;
            }
            task.transition_to(HostRoleStatus::Aborted)?;
            *task = self.db.update_task_status(
                task.task_id,
                TaskStatusUpdate::new(HostRoleStatus::Aborted, now),
            )?;
            summary.aborted += 1;
            info!(
                "tarea {} ({} {} en {}) abortada: {}",
                task.task_id, task.role, task.role_command, task.host_name, reason
            );
        }
        Ok(())
    }

    fn dispatch_stage(
        &self,
        view: &mut RequestView,
        idx: usize,
        slots: &mut HostSlots,
        now: DateTime<Utc>,
        summary: &mut WorkSummary,
    ) -> Result<(), SchedulerError> {
        let RequestView { request, stages } = view;
        let (stage, tasks) = &mut stages[idx];
        let mut unreachable: HashSet<HostName> = HashSet::new();

        for task in tasks.iter_mut() {
            if !task.status.is_dispatchable() {
                continue;
            }
            if slots.global_full() {
                debug!("tope global de tareas en vuelo alcanzado");
                break;
            }
            if unreachable.contains(&task.host_name) || slots.host_full(&task.host_name) {
                continue;
            }

            // primero persistir, después despachar
            let previous = task.clone();
            task.begin_attempt(now)?;
            self.db.persist_task(task)?;

            let command = build_agent_command(request, stage, task);
            match self.dispatcher.dispatch(&task.host_name, command) {
                Ok(handle) => {
                    slots.occupy(&task.host_name);
                    summary.dispatched += 1;
                    info!(
                        "tarea {} ({} {}) despachada a {} (intento {}/{}, dispatch {})",
                        task.task_id,
                        task.role,
                        task.role_command,
                        handle.host_name,
                        task.attempt_count,
                        self.retry.max_attempts(),
                        handle.dispatch_id
                    );
                }
                Err(e) => {
                    // nunca salió: no cuenta como intento
                    warn!("no se pudo despachar la tarea {}: {}", task.task_id, e);
                    *task = previous;
                    unreachable.insert(task.host_name.clone());
                    summary.dispatch_failures += 1;
                    if let Err(e) = self.db.persist_task(task) {
                        self.pending_reverts
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .push(task.clone());
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(())
    }

    /// Reintenta las vueltas atrás pendientes. Sólo pisa la tarea si sigue en el
    /// intento que se le asignó al despachar.
    fn flush_reverts(&self) {
        let pending = std::mem::take(
            &mut *self.pending_reverts.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let mut still_pending = Vec::new();
        for previous in pending {
            let current = match self.db.get_task(previous.task_id) {
                Ok(Some(current)) => current,
                Ok(None) => continue,
                Err(e) => {
                    warn!("no se pudo leer la tarea {}: {}", previous.task_id, e);
                    still_pending.push(previous);
                    continue;
                }
            };
            if current.status != HostRoleStatus::InProgress
                || current.attempt_count != previous.attempt_count + 1
            {
                continue;
            }
            match self.db.persist_task(&previous) {
                Ok(()) => info!(
                    "tarea {} vuelve a {} tras un despacho rechazado",
                    previous.task_id, previous.status
                ),
                Err(e) => {
                    warn!("la tarea {} sigue sin volver atrás: {}", previous.task_id, e);
                    still_pending.push(previous);
                }
            }
        }
        if !still_pending.is_empty() {
            self.pending_reverts
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend(still_pending);
        }
    }

    fn check_timeouts(
        &self,
        view: &mut RequestView,
        open: bool,
        slots: &mut HostSlots,
        now: DateTime<Utc>,
        summary: &mut WorkSummary,
    ) -> Result<(), SchedulerError> {
        for task in view.stages.iter_mut().flat_map(|(_, tasks)| tasks.iter_mut()) {
            if task.is_timed_out(now) {
                warn!(
                    "tarea {} ({} {} en {}) venció tras {}s (intento {})",
                    task.task_id, task.role, task.role_command, task.host_name, task.timeout_secs, task.attempt_count
                );
                task.transition_to(HostRoleStatus::TimedOut)?;
                *task = self.db.update_task_status(
                    task.task_id,
                    TaskStatusUpdate::new(HostRoleStatus::TimedOut, now),
                )?;
                slots.release(&task.host_name);
                summary.timed_out += 1;
            }
            // también recoge TIMEDOUT persistidos antes de un reinicio
            if task.status == HostRoleStatus::TimedOut {
                self.settle_failure(task, open, now, summary)?;
            }
        }
        Ok(())
    }

    /// Decide reintento para una tarea TIMEDOUT y lo persiste.
    fn settle_failure(
        &self,
        task: &mut HostRoleCommand,
        open: bool,
        now: DateTime<Utc>,
        summary: &mut WorkSummary,
    ) -> Result<(), SchedulerError> {
        let decision = self.retry.apply(task, open)?;
        *task = self
            .db
            .update_task_status(task.task_id, TaskStatusUpdate::new(task.status, now))?;
        self.note_decision(task, decision, summary);
        Ok(())
    }

    fn note_decision(&self, task: &HostRoleCommand, decision: RetryDecision, summary: &mut WorkSummary) {
        match decision {
            RetryDecision::Retry => {
                summary.retried += 1;
                info!(
                    "reencolando tarea {} (intento {} de {})",
                    task.task_id,
                    task.attempt_count + 1,
                    self.retry.max_attempts()
                );
            }
            RetryDecision::GiveUp => {
                summary.failed += 1;
                warn!(
                    "tarea {} ({} {} en {}) queda FAILED tras {} intentos",
                    task.task_id, task.role, task.role_command, task.host_name, task.attempt_count
                );
            }
        }
    }

    fn consume_reports(&self, now: DateTime<Utc>, summary: &mut WorkSummary) {
        let mut retry_later = Vec::new();
        for report in self.reports.drain() {
            match self.apply_report(&report, now, summary) {
                Ok(true) => summary.reports_applied += 1,
                Ok(false) => summary.reports_ignored += 1,
                Err(SchedulerError::Persistence(e)) => {
                    warn!("reporte de la tarea {} queda para la próxima pasada: {}", report.task_id, e);
                    retry_later.push(report);
                }
                Err(e) => {
                    warn!("reporte de la tarea {} descartado: {}", report.task_id, e);
                    summary.reports_ignored += 1;
                }
            }
        }
        self.reports.requeue(retry_later);
    }

    /// Aplica un reporte si corresponde al intento actual de la tarea.
    fn apply_report(
        &self,
        report: &CommandReport,
        now: DateTime<Utc>,
        summary: &mut WorkSummary,
    ) -> Result<bool, SchedulerError> {
        let Some(mut task) = self.db.get_task(report.task_id)? else {
            warn!("reporte para la tarea desconocida {}", report.task_id);
            return Ok(false);
        };
        if task.host_name != report.host_name {
            warn!(
                "reporte de la tarea {} llegó desde {} pero corre en {}",
                report.task_id, report.host_name, task.host_name
            );
            return Ok(false);
        }
        if task.status != HostRoleStatus::InProgress || task.attempt_count != report.attempt {
            debug!(
                "reporte viejo o duplicado para la tarea {} (estado {}, intento {} vs {})",
                task.task_id, task.status, task.attempt_count, report.attempt
            );
            return Ok(false);
        }

        match report.status {
            ReportStatus::InProgress => {
                self.db.update_task_status(
                    task.task_id,
                    TaskStatusUpdate::new(HostRoleStatus::InProgress, now).with_output(
                        None,
                        &report.stdout,
                        &report.stderr,
                    ),
                )?;
            }
            ReportStatus::Completed => {
                task.transition_to(HostRoleStatus::Completed)?;
                self.db.update_task_status(
                    task.task_id,
                    TaskStatusUpdate::new(HostRoleStatus::Completed, now).with_output(
                        report.exit_code,
                        &report.stdout,
                        &report.stderr,
                    ),
                )?;
                info!(
                    "tarea {} ({} {} en {}) COMPLETED",
                    task.task_id, task.role, task.role_command, task.host_name
                );
            }
            ReportStatus::Failed => {
                // se mira antes de registrar este fallo
                let open = self.request_open(task.request_id)?;
                task.transition_to(HostRoleStatus::Failed)?;
                warn!(
                    "tarea {} ({} {} en {}) falló con exit code {:?}",
                    task.task_id, task.role, task.role_command, task.host_name, report.exit_code
                );
                let decision = self.retry.apply(&mut task, open)?;
                self.db.update_task_status(
                    task.task_id,
                    TaskStatusUpdate::new(task.status, now).with_output(
                        report.exit_code,
                        &report.stdout,
                        &report.stderr,
                    ),
                )?;
                self.note_decision(&task, decision, summary);
            }
        }
        Ok(true)
    }

    fn request_open(&self, request_id: RequestId) -> Result<bool, SchedulerError> {
        let Some(view) = RequestView::load_by_id(self.db.as_ref(), request_id)? else {
            return Ok(false);
        };
        Ok(!view.request.abort_requested && view.status() != RequestStatus::Failed)
    }

    fn log_status_changes(&self, request_ids: &[RequestId]) {
        let mut last = self.last_status.lock().unwrap_or_else(PoisonError::into_inner);
        for &request_id in request_ids {
            let view = match RequestView::load_by_id(self.db.as_ref(), request_id) {
                Ok(Some(view)) => view,
                Ok(None) => continue,
                Err(e) => {
                    debug!("no se pudo releer el request {}: {}", request_id, e);
                    continue;
                }
            };
            let status = view.status();
            let in_flight = view.tasks().any(|t| !t.status.is_terminal());
            let previous = last.insert(request_id, status);
            if previous != Some(status) {
                info!("request {} ({}) -> {}", request_id, view.request.context, status);
            }
            if !in_flight {
                last.remove(&request_id);
            }
        }
    }
}

pub(crate) fn build_agent_command(request: &Request, stage: &Stage, task: &HostRoleCommand) -> AgentCommand {
    AgentCommand {
        dispatch_id: Uuid::new_v4().to_string(),
        task_id: task.task_id,
        request_id: task.request_id,
        stage_id: task.stage_id,
        attempt: task.attempt_count,
        host_name: task.host_name.clone(),
        role: task.role.clone(),
        role_command: task.role_command.clone(),
        command_type: task.role_command.kind().to_string(),
        custom_command: task.role_command.custom_name().map(str::to_string),
        payload: task.payload.clone(),
        cluster_host_info: if stage.cluster_host_info.is_empty() {
            request.cluster_host_info.clone()
        } else {
            stage.cluster_host_info.clone()
        },
        timeout_secs: task.timeout_secs,
    }
}

/// Corre `do_work` cada `sleep_time`. Los errores se loguean y se reintenta.
pub async fn run_scheduler_loop(scheduler: Arc<ActionScheduler>) {
    let sleep_time: Duration = scheduler.settings().sleep_time();
    info!("scheduler de acciones arrancado (cada {:?})", sleep_time);
    loop {
        sleep(sleep_time).await;

        let worker = scheduler.clone();
        match tokio::task::spawn_blocking(move || worker.do_work()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("error en la pasada del scheduler: {}", e),
            Err(e) => warn!("la pasada del scheduler terminó con pánico: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::{seed_request, start};
    use crate::db::{InMemoryActionDb, Result as DbResult};
    use crate::dispatch::{DispatchError, DispatchHandle};
    use common::{StageId, TaskId};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use chrono::Duration as ChronoDuration;
    use proptest::prelude::*;

    /// Acepta todo y recuerda qué se despachó.
    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<AgentCommand>>,
        refuse: Mutex<HashSet<String>>,
    }

    impl Recorder {
        fn sent_ids(&self) -> Vec<u64> {
            self.sent.lock().unwrap().iter().map(|c| c.task_id).collect()
        }
    }

    impl AgentDispatcher for Recorder {
        fn dispatch(&self, host_name: &str, command: AgentCommand) -> Result<DispatchHandle, DispatchError> {
            if self.refuse.lock().unwrap().contains(host_name) {
                return Err(DispatchError::HostNotRegistered(host_name.to_string()));
            }
            let handle = DispatchHandle {
                dispatch_id: command.dispatch_id.clone(),
                host_name: host_name.to_string(),
                task_id: command.task_id,
            };
            self.sent.lock().unwrap().push(command);
            Ok(handle)
        }
    }

    /// Store en memoria que falla a pedido.
    #[derive(Default)]
    struct FlakyDb {
        inner: InMemoryActionDb,
        failing_updates: AtomicUsize,
        failing_reverts: AtomicUsize,
    }

    fn take_one(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    impl ActionDbAccessor for FlakyDb {
        fn allocate_request_id(&self) -> DbResult<RequestId> {
            self.inner.allocate_request_id()
        }
        fn allocate_task_ids(&self, count: usize) -> DbResult<Vec<TaskId>> {
            self.inner.allocate_task_ids(count)
        }
        fn persist_request(&self, request: &Request) -> DbResult<()> {
            self.inner.persist_request(request)
        }
        fn persist_stage(&self, stage: &Stage) -> DbResult<()> {
            self.inner.persist_stage(stage)
        }
        fn persist_task(&self, task: &HostRoleCommand) -> DbResult<()> {
            if task.status.is_dispatchable() && take_one(&self.failing_reverts) {
                return Err(PersistenceError::Other("disco lleno".into()));
            }
            self.inner.persist_task(task)
        }
        fn get_request(&self, request_id: RequestId) -> DbResult<Option<Request>> {
            self.inner.get_request(request_id)
        }
        fn get_requests(&self) -> DbResult<Vec<Request>> {
            self.inner.get_requests()
        }
        fn get_stages_for_request(&self, request_id: RequestId) -> DbResult<Vec<Stage>> {
            self.inner.get_stages_for_request(request_id)
        }
        fn get_tasks_for_stage(&self, request_id: RequestId, stage_id: StageId) -> DbResult<Vec<HostRoleCommand>> {
            self.inner.get_tasks_for_stage(request_id, stage_id)
        }
        fn get_task(&self, task_id: TaskId) -> DbResult<Option<HostRoleCommand>> {
            self.inner.get_task(task_id)
        }
        fn update_task_status(&self, task_id: TaskId, update: TaskStatusUpdate) -> DbResult<HostRoleCommand> {
            if take_one(&self.failing_updates) {
                return Err(PersistenceError::Other("disco lleno".into()));
            }
            self.inner.update_task_status(task_id, update)
        }
        fn get_in_flight_requests(&self) -> DbResult<Vec<Request>> {
            self.inner.get_in_flight_requests()
        }
        fn mark_request_aborted(&self, request_id: RequestId) -> DbResult<()> {
            self.inner.mark_request_aborted(request_id)
        }
    }

    fn flaky_setup() -> (Arc<FlakyDb>, Arc<Recorder>, ReportQueue, ActionScheduler) {
        let db = Arc::new(FlakyDb::default());
        let recorder = Arc::new(Recorder::default());
        let reports = ReportQueue::new();
        let scheduler = ActionScheduler::new(db.clone(), recorder.clone(), reports.clone(), settings());
        (db, recorder, reports, scheduler)
    }

    fn settings() -> SchedulerSettings {
        SchedulerSettings {
            max_attempts: 2,
            max_in_flight_per_host: 2,
            max_in_flight_total: 10,
            ..SchedulerSettings::default()
        }
    }

    fn setup(settings: SchedulerSettings) -> (Arc<InMemoryActionDb>, Arc<Recorder>, ReportQueue, ActionScheduler) {
        let db = Arc::new(InMemoryActionDb::new());
        let recorder = Arc::new(Recorder::default());
        let reports = ReportQueue::new();
        let scheduler = ActionScheduler::new(db.clone(), recorder.clone(), reports.clone(), settings);
        (db, recorder, reports, scheduler)
    }

    fn report(task: &HostRoleCommand, status: ReportStatus) -> CommandReport {
        CommandReport {
            task_id: task.task_id,
            attempt: task.attempt_count,
            host_name: task.host_name.clone(),
            status,
            exit_code: match status {
                ReportStatus::Completed => Some(0),
                ReportStatus::Failed => Some(1),
                ReportStatus::InProgress => None,
            },
            stdout: "out".into(),
            stderr: String::new(),
        }
    }

    fn task(db: &dyn ActionDbAccessor, id: u64) -> HostRoleCommand {
        db.get_task(id).unwrap().unwrap()
    }

    #[test]
    fn stages_run_in_order() {
        let (db, recorder, reports, scheduler) = setup(settings());
        let (request_id, ids) = seed_request(
            db.as_ref(),
            vec![
                (false, vec![start("h1", "A"), start("h2", "A")]),
                (false, vec![start("h1", "B")]),
            ],
        );

        let first = scheduler.do_work().unwrap();
        assert_eq!(first.dispatched, 2);
        assert_eq!(recorder.sent_ids(), vec![ids[0], ids[1]]);

        // el segundo stage espera al primero
        scheduler.do_work().unwrap();
        assert_eq!(recorder.sent_ids().len(), 2);

        reports.push(report(&task(db.as_ref(), ids[0]), ReportStatus::Completed));
        reports.push(report(&task(db.as_ref(), ids[1]), ReportStatus::Completed));
        let applied = scheduler.do_work().unwrap();
        assert_eq!(applied.reports_applied, 2);

        scheduler.do_work().unwrap();
        assert_eq!(recorder.sent_ids(), ids);

        reports.push(report(&task(db.as_ref(), ids[2]), ReportStatus::Completed));
        scheduler.do_work().unwrap();
        let view = RequestView::load_by_id(db.as_ref(), request_id).unwrap().unwrap();
        assert_eq!(view.status(), RequestStatus::Completed);
        assert!(db.get_in_flight_requests().unwrap().is_empty());
    }

    #[test]
    fn per_host_cap_is_respected() {
        let (db, recorder, _reports, scheduler) = setup(SchedulerSettings {
            max_in_flight_per_host: 1,
            ..settings()
        });
        seed_request(
            db.as_ref(),
            vec![(false, vec![start("h1", "A"), start("h1", "B"), start("h2", "C")])],
        );
        let summary = scheduler.do_work().unwrap();
        assert_eq!(summary.dispatched, 2);
        assert_eq!(recorder.sent_ids(), vec![1, 3]);
    }

    #[test]
    fn global_cap_is_respected() {
        let (db, recorder, _reports, scheduler) = setup(SchedulerSettings {
            max_in_flight_total: 1,
            ..settings()
        });
        seed_request(db.as_ref(), vec![(false, vec![start("h1", "A"), start("h2", "B")])]);
        seed_request(db.as_ref(), vec![(false, vec![start("h3", "C")])]);
        scheduler.do_work().unwrap();
        assert_eq!(recorder.sent_ids(), vec![1]);
    }

    #[test]
    fn refused_dispatch_is_not_an_attempt() {
        let (db, recorder, _reports, scheduler) = setup(settings());
        recorder.refuse.lock().unwrap().insert("h1".into());
        seed_request(db.as_ref(), vec![(false, vec![start("h1", "A")])]);

        for _ in 0..3 {
            let summary = scheduler.do_work().unwrap();
            assert_eq!(summary.dispatch_failures, 1);
        }
        let t = task(db.as_ref(), 1);
        assert_eq!(t.status, HostRoleStatus::Pending);
        assert_eq!(t.attempt_count, 0);
        assert!(t.start_time.is_none());

        recorder.refuse.lock().unwrap().clear();
        scheduler.do_work().unwrap();
        let t = task(db.as_ref(), 1);
        assert_eq!(t.status, HostRoleStatus::InProgress);
        assert_eq!(t.attempt_count, 1);
    }

    #[test]
    fn failure_is_retried_then_fails_request() {
        let (db, recorder, reports, scheduler) = setup(settings());
        let (request_id, ids) = seed_request(
            db.as_ref(),
            vec![(false, vec![start("h1", "A")]), (false, vec![start("h1", "B")])],
        );

        scheduler.do_work().unwrap();
        reports.push(report(&task(db.as_ref(), ids[0]), ReportStatus::Failed));
        let summary = scheduler.do_work().unwrap();
        assert_eq!(summary.retried, 1);
        assert_eq!(task(db.as_ref(), ids[0]).status, HostRoleStatus::Queued);

        scheduler.do_work().unwrap();
        assert_eq!(task(db.as_ref(), ids[0]).attempt_count, 2);
        reports.push(report(&task(db.as_ref(), ids[0]), ReportStatus::Failed));
        scheduler.do_work().unwrap();
        assert_eq!(task(db.as_ref(), ids[0]).status, HostRoleStatus::Failed);

        // contención: lo que quedaba pendiente se aborta
        scheduler.do_work().unwrap();
        assert_eq!(task(db.as_ref(), ids[1]).status, HostRoleStatus::Aborted);
        assert_eq!(recorder.sent_ids(), vec![ids[0], ids[0]]);
        let view = RequestView::load_by_id(db.as_ref(), request_id).unwrap().unwrap();
        assert_eq!(view.status(), RequestStatus::Failed);
    }

    #[test]
    fn skippable_stage_failure_does_not_stop_request() {
        let (db, _recorder, reports, scheduler) = setup(SchedulerSettings {
            max_attempts: 1,
            ..settings()
        });
        let (request_id, ids) = seed_request(
            db.as_ref(),
            vec![(true, vec![start("h1", "A")]), (false, vec![start("h1", "B")])],
        );
        scheduler.do_work().unwrap();
        reports.push(report(&task(db.as_ref(), ids[0]), ReportStatus::Failed));
        scheduler.do_work().unwrap();
        assert_eq!(task(db.as_ref(), ids[0]).status, HostRoleStatus::Failed);

        scheduler.do_work().unwrap();
        assert_eq!(task(db.as_ref(), ids[1]).status, HostRoleStatus::InProgress);
        reports.push(report(&task(db.as_ref(), ids[1]), ReportStatus::Completed));
        scheduler.do_work().unwrap();

        let view = RequestView::load_by_id(db.as_ref(), request_id).unwrap().unwrap();
        assert_eq!(view.status(), RequestStatus::SkippedFailed);
    }

    #[test]
    fn timeout_retries_until_budget_is_spent() {
        let (db, recorder, _reports, scheduler) = setup(settings());
        seed_request(db.as_ref(), vec![(false, vec![start("h1", "A")])]);

        let t0 = Utc::now();
        scheduler.do_work_at(t0).unwrap();
        let after_first = t0 + ChronoDuration::seconds(61);
        let summary = scheduler.do_work_at(after_first).unwrap();
        assert_eq!(summary.timed_out, 1);
        assert_eq!(summary.retried, 1);
        assert_eq!(task(db.as_ref(), 1).status, HostRoleStatus::Queued);

        scheduler.do_work_at(after_first).unwrap();
        assert_eq!(task(db.as_ref(), 1).attempt_count, 2);
        let summary = scheduler.do_work_at(after_first + ChronoDuration::seconds(61)).unwrap();
        assert_eq!(summary.failed, 1);

        let t = task(db.as_ref(), 1);
        assert_eq!(t.status, HostRoleStatus::Failed);
        assert_eq!(t.attempt_count, 2);
        assert_eq!(recorder.sent_ids(), vec![1, 1]);
    }

    #[test]
    fn stale_and_duplicate_reports_are_ignored() {
        let (db, _recorder, reports, scheduler) = setup(settings());
        seed_request(db.as_ref(), vec![(false, vec![start("h1", "A")])]);
        scheduler.do_work().unwrap();

        let running = task(db.as_ref(), 1);
        let mut wrong_attempt = report(&running, ReportStatus::Completed);
        wrong_attempt.attempt = 7;
        let mut wrong_host = report(&running, ReportStatus::Completed);
        wrong_host.host_name = "h9".into();
        reports.push(wrong_attempt);
        reports.push(wrong_host);
        let summary = scheduler.do_work().unwrap();
        assert_eq!(summary.reports_ignored, 2);
        assert_eq!(task(db.as_ref(), 1).status, HostRoleStatus::InProgress);

        let done = report(&running, ReportStatus::Completed);
        reports.push(done.clone());
        reports.push(done);
        let summary = scheduler.do_work().unwrap();
        assert_eq!(summary.reports_applied, 1);
        assert_eq!(summary.reports_ignored, 1);
        assert_eq!(task(db.as_ref(), 1).status, HostRoleStatus::Completed);
    }

    #[test]
    fn progress_report_only_updates_output() {
        let (db, _recorder, reports, scheduler) = setup(settings());
        seed_request(db.as_ref(), vec![(false, vec![start("h1", "A")])]);
        scheduler.do_work().unwrap();

        reports.push(report(&task(db.as_ref(), 1), ReportStatus::InProgress));
        scheduler.do_work().unwrap();
        let t = task(db.as_ref(), 1);
        assert_eq!(t.status, HostRoleStatus::InProgress);
        assert_eq!(t.stdout, "out");
        assert!(t.end_time.is_none());
    }

    #[test]
    fn abort_stops_unstarted_work() {
        let (db, _recorder, reports, scheduler) = setup(settings());
        let (request_id, ids) = seed_request(
            db.as_ref(),
            vec![(false, vec![start("h1", "A")]), (false, vec![start("h2", "B")])],
        );
        scheduler.do_work().unwrap();
        db.mark_request_aborted(request_id).unwrap();

        let summary = scheduler.do_work().unwrap();
        assert_eq!(summary.aborted, 1);
        assert_eq!(task(db.as_ref(), ids[1]).status, HostRoleStatus::Aborted);
        // lo que ya corría termina con su resultado natural, sin reintento
        assert_eq!(task(db.as_ref(), ids[0]).status, HostRoleStatus::InProgress);
        reports.push(report(&task(db.as_ref(), ids[0]), ReportStatus::Failed));
        scheduler.do_work().unwrap();
        assert_eq!(task(db.as_ref(), ids[0]).status, HostRoleStatus::Failed);
        assert!(db.get_in_flight_requests().unwrap().is_empty());
    }

    #[test]
    fn store_failure_only_stalls_the_affected_request() {
        let (db, recorder, reports, scheduler) = flaky_setup();
        let (first, ids) = seed_request(
            db.as_ref(),
            vec![(false, vec![start("h1", "A")]), (false, vec![start("h1", "B")])],
        );
        scheduler.do_work().unwrap();
        assert_eq!(recorder.sent_ids(), vec![ids[0]]);

        reports.push(report(&task(db.as_ref(), ids[0]), ReportStatus::Completed));
        db.mark_request_aborted(first).unwrap();
        let (_second, other) = seed_request(db.as_ref(), vec![(false, vec![start("h2", "C")])]);
        // falla el abort de la tarea pendiente y después el reporte
        db.failing_updates.store(2, Ordering::SeqCst);

        let summary = scheduler.do_work().unwrap();
        assert_eq!(summary.request_errors, 1);
        assert_eq!(summary.dispatched, 1);
        assert_eq!(summary.reports_applied, 0);
        assert_eq!(recorder.sent_ids(), vec![ids[0], other[0]]);
        assert_eq!(task(db.as_ref(), ids[1]).status, HostRoleStatus::Pending);
        assert_eq!(task(db.as_ref(), ids[0]).status, HostRoleStatus::InProgress);
        assert_eq!(reports.len(), 1);

        let summary = scheduler.do_work().unwrap();
        assert_eq!(summary.aborted, 1);
        assert_eq!(summary.reports_applied, 1);
        assert!(reports.is_empty());
        assert_eq!(task(db.as_ref(), ids[0]).status, HostRoleStatus::Completed);
        let view = RequestView::load_by_id(db.as_ref(), first).unwrap().unwrap();
        assert_eq!(view.status(), RequestStatus::Aborted);
    }

    #[test]
    fn failed_revert_of_refused_dispatch_is_retried() {
        let (db, recorder, _reports, scheduler) = flaky_setup();
        recorder.refuse.lock().unwrap().insert("h1".into());
        seed_request(db.as_ref(), vec![(false, vec![start("h1", "A")])]);
        db.failing_reverts.store(1, Ordering::SeqCst);

        let summary = scheduler.do_work().unwrap();
        assert_eq!(summary.dispatch_failures, 1);
        assert_eq!(summary.request_errors, 1);
        assert_eq!(task(db.as_ref(), 1).status, HostRoleStatus::InProgress);

        scheduler.do_work().unwrap();
        let t = task(db.as_ref(), 1);
        assert_eq!(t.status, HostRoleStatus::Pending);
        assert_eq!(t.attempt_count, 0);
        assert!(t.start_time.is_none());

        recorder.refuse.lock().unwrap().clear();
        scheduler.do_work().unwrap();
        let t = task(db.as_ref(), 1);
        assert_eq!(t.status, HostRoleStatus::InProgress);
        assert_eq!(t.attempt_count, 1);
    }

    #[test]
    fn aborted_request_with_skippable_tail_ends_aborted() {
        let (db, _recorder, reports, scheduler) = setup(settings());
        let (request_id, ids) = seed_request(
            db.as_ref(),
            vec![(false, vec![start("h1", "A")]), (true, vec![start("h2", "B")])],
        );
        scheduler.do_work().unwrap();
        db.mark_request_aborted(request_id).unwrap();
        scheduler.do_work().unwrap();
        assert_eq!(task(db.as_ref(), ids[1]).status, HostRoleStatus::Aborted);

        reports.push(report(&task(db.as_ref(), ids[0]), ReportStatus::Completed));
        scheduler.do_work().unwrap();
        assert_eq!(task(db.as_ref(), ids[0]).status, HostRoleStatus::Completed);

        let view = RequestView::load_by_id(db.as_ref(), request_id).unwrap().unwrap();
        assert_eq!(view.status(), RequestStatus::Aborted);
        assert!(db.get_in_flight_requests().unwrap().is_empty());
    }

    #[test]
    fn timed_out_task_left_by_a_crash_is_settled() {
        let (db, recorder, _reports, scheduler) = setup(settings());
        seed_request(db.as_ref(), vec![(false, vec![start("h1", "A")])]);
        let mut t = task(db.as_ref(), 1);
        t.begin_attempt(Utc::now()).unwrap();
        t.transition_to(HostRoleStatus::TimedOut).unwrap();
        db.persist_task(&t).unwrap();

        let summary = scheduler.do_work().unwrap();
        assert_eq!(summary.retried, 1);
        assert_eq!(task(db.as_ref(), 1).status, HostRoleStatus::Queued);
        scheduler.do_work().unwrap();
        assert_eq!(recorder.sent_ids(), vec![1]);
        assert_eq!(task(db.as_ref(), 1).attempt_count, 2);
    }

    #[test]
    fn command_carries_attempt_and_custom_name() {
        let (db, recorder, _reports, scheduler) = setup(settings());
        let restart = common::CommandSpec::new(
            "h1",
            "NAMENODE",
            common::RoleCommand::CustomCommand("RESTART".into()),
        );
        seed_request(db.as_ref(), vec![(false, vec![restart])]);
        scheduler.do_work().unwrap();
        let sent = recorder.sent.lock().unwrap();
        assert_eq!(sent[0].attempt, 1);
        assert_eq!(sent[0].custom_command.as_deref(), Some("RESTART"));
        assert_eq!(sent[0].timeout_secs, 60);
    }

    proptest! {
        #[test]
        fn attempts_never_exceed_budget(
            outcomes in proptest::collection::vec(0u8..3, 1..12),
            max in 1u32..4,
        ) {
            let (db, _recorder, reports, scheduler) = setup(SchedulerSettings {
                max_attempts: max,
                ..settings()
            });
            seed_request(db.as_ref(), vec![(false, vec![start("h1", "A")])]);

            let mut now = Utc::now();
            for outcome in outcomes {
                scheduler.do_work_at(now).unwrap();
                let t = task(db.as_ref(), 1);
                if t.status.is_terminal() {
                    break;
                }
                match outcome {
                    0 => reports.push(report(&t, ReportStatus::Failed)),
                    1 => now += ChronoDuration::seconds(61),
                    _ => reports.push(report(&t, ReportStatus::InProgress)),
                }
            }
            scheduler.do_work_at(now).unwrap();

            let t = task(db.as_ref(), 1);
            prop_assert!(t.attempt_count <= max);
            if t.status == HostRoleStatus::Failed {
                prop_assert_eq!(t.attempt_count, max);
            }
        }
    }
}
