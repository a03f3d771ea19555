use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Estado de un HostRoleCommand.
///
/// ```text
/// PENDING -> QUEUED -> IN_PROGRESS -> {COMPLETED | FAILED | TIMEDOUT | ABORTED}
/// FAILED / TIMEDOUT -> QUEUED   (reintento)
/// TIMEDOUT -> FAILED            (sin intentos)
/// cualquier no terminal -> ABORTED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostRoleStatus {
    Pending,
    Queued,
    InProgress,
    Completed,
    Failed,
    #[serde(rename = "TIMEDOUT")]
    TimedOut,
    Aborted,
}

impl HostRoleStatus {
    pub const ALL: [HostRoleStatus; 7] = [
        HostRoleStatus::Pending,
        HostRoleStatus::Queued,
        HostRoleStatus::InProgress,
        HostRoleStatus::Completed,
        HostRoleStatus::Failed,
        HostRoleStatus::TimedOut,
        HostRoleStatus::Aborted,
    ];

    /// FAILED sólo se persiste una vez agotados los reintentos, por eso es terminal.
    /// TIMEDOUT es transitorio: siempre le sigue QUEUED o FAILED.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            HostRoleStatus::Completed | HostRoleStatus::Failed | HostRoleStatus::Aborted
        )
    }

    /// Estado terminal que cuenta como fallo del stage.
    pub fn is_failure(&self) -> bool {
        matches!(self, HostRoleStatus::Failed | HostRoleStatus::Aborted)
    }

    /// Listo para despachar.
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, HostRoleStatus::Pending | HostRoleStatus::Queued)
    }

    pub fn can_transition_to(&self, next: HostRoleStatus) -> bool {
        use HostRoleStatus::*;
        match (self, next) {
            (Pending, Queued | InProgress | Aborted) => true,
            (Queued, InProgress | Aborted) => true,
            (InProgress, Completed | Failed | TimedOut | Aborted) => true,
            (Failed, Queued) => true,
            (TimedOut, Queued | Failed | Aborted) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HostRoleStatus::Pending => "PENDING",
            HostRoleStatus::Queued => "QUEUED",
            HostRoleStatus::InProgress => "IN_PROGRESS",
            HostRoleStatus::Completed => "COMPLETED",
            HostRoleStatus::Failed => "FAILED",
            HostRoleStatus::TimedOut => "TIMEDOUT",
            HostRoleStatus::Aborted => "ABORTED",
        }
    }
}

impl fmt::Display for HostRoleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("transición inválida {from} -> {to}")]
pub struct InvalidTransition {
    pub from: HostRoleStatus,
    pub to: HostRoleStatus,
}

/// Estado agregado de un Request. Siempre derivado de sus tareas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    InProgress,
    Completed,
    Failed,
    /// Todas las tareas terminaron y los fallos quedaron en stages skippable.
    SkippedFailed,
    /// Se pidió abort y ya no queda nada corriendo.
    Aborted,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestStatus::InProgress)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::InProgress => "IN_PROGRESS",
            RequestStatus::Completed => "COMPLETED",
            RequestStatus::Failed => "FAILED",
            RequestStatus::SkippedFailed => "SKIPPED_FAILED",
            RequestStatus::Aborted => "ABORTED",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "IN_PROGRESS" => Ok(RequestStatus::InProgress),
            "COMPLETED" => Ok(RequestStatus::Completed),
            "FAILED" => Ok(RequestStatus::Failed),
            "SKIPPED_FAILED" => Ok(RequestStatus::SkippedFailed),
            "ABORTED" => Ok(RequestStatus::Aborted),
            other => Err(format!("estado de request inválido: {}", other)),
        }
    }
}

/// Conteo de estados de las tareas de un stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSummary {
    pub skippable: bool,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub terminal: usize,
}

impl StageSummary {
    pub fn from_statuses<I>(skippable: bool, statuses: I) -> Self
    where
        I: IntoIterator<Item = HostRoleStatus>,
    {
        let mut summary = StageSummary {
            skippable,
            ..Default::default()
        };
        for status in statuses {
            summary.total += 1;
            if status.is_terminal() {
                summary.terminal += 1;
            }
            if status == HostRoleStatus::Completed {
                summary.completed += 1;
            }
            if status.is_failure() {
                summary.failed += 1;
            }
        }
        summary
    }

    pub fn all_terminal(&self) -> bool {
        self.terminal == self.total
    }

    pub fn all_completed(&self) -> bool {
        self.completed == self.total
    }

    /// Fallo que tumba el request entero.
    pub fn has_fatal_failure(&self) -> bool {
        !self.skippable && self.failed > 0
    }

    /// El stage siguiente puede empezar.
    pub fn allows_next_stage(&self) -> bool {
        self.all_terminal() && (self.failed == 0 || self.skippable)
    }
}

/// COMPLETED sii todas las tareas están COMPLETED; FAILED si algún stage no skippable
/// tiene una tarea FAILED/ABORTED; SKIPPED_FAILED si todo terminó con fallos sólo en
/// stages skippable; en otro caso IN_PROGRESS.
pub fn derive_request_status(stages: &[StageSummary]) -> RequestStatus {
    if stages.iter().all(StageSummary::all_completed) {
        return RequestStatus::Completed;
    }
    if stages.iter().any(StageSummary::has_fatal_failure) {
        return RequestStatus::Failed;
    }
    if stages.iter().all(StageSummary::all_terminal) {
        return RequestStatus::SkippedFailed;
    }
    RequestStatus::InProgress
}

/// Estado de un request con abort pedido: IN_PROGRESS mientras algo siga corriendo,
/// después ABORTED. Nunca vuelve a COMPLETED ni SKIPPED_FAILED.
pub fn derive_aborted_request_status(stages: &[StageSummary]) -> RequestStatus {
    if stages.iter().all(StageSummary::all_terminal) {
        RequestStatus::Aborted
    } else {
        RequestStatus::InProgress
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use HostRoleStatus::*;

    #[test]
    fn transitions_follow_fsm() {
        assert!(Pending.can_transition_to(InProgress));
        assert!(Queued.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(TimedOut));
        assert!(TimedOut.can_transition_to(Queued));
        assert!(Failed.can_transition_to(Queued));

        assert!(!Completed.can_transition_to(Queued));
        assert!(!Aborted.can_transition_to(InProgress));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!InProgress.can_transition_to(Pending));
    }

    #[test]
    fn every_non_terminal_state_can_abort() {
        for status in HostRoleStatus::ALL {
            if !status.is_terminal() {
                assert!(status.can_transition_to(Aborted), "{} -> ABORTED", status);
            }
        }
    }

    #[test]
    fn skippable_failures_do_not_fail_request() {
        let stages = [
            StageSummary::from_statuses(true, [Completed, Failed]),
            StageSummary::from_statuses(false, [Completed]),
        ];
        assert_eq!(derive_request_status(&stages), RequestStatus::SkippedFailed);

        let stages = [
            StageSummary::from_statuses(true, [Failed]),
            StageSummary::from_statuses(false, [Pending]),
        ];
        assert_eq!(derive_request_status(&stages), RequestStatus::InProgress);
    }

    #[test]
    fn aborted_request_settles_as_aborted() {
        let running = [
            StageSummary::from_statuses(false, [InProgress]),
            StageSummary::from_statuses(true, [Aborted]),
        ];
        assert_eq!(derive_aborted_request_status(&running), RequestStatus::InProgress);

        let done = [
            StageSummary::from_statuses(false, [Completed]),
            StageSummary::from_statuses(true, [Aborted]),
        ];
        assert_eq!(derive_request_status(&done), RequestStatus::SkippedFailed);
        assert_eq!(derive_aborted_request_status(&done), RequestStatus::Aborted);

        let all_completed = [StageSummary::from_statuses(false, [Completed])];
        assert_eq!(derive_aborted_request_status(&all_completed), RequestStatus::Aborted);
        assert!(RequestStatus::Aborted.is_terminal());
        assert_eq!("aborted".parse::<RequestStatus>(), Ok(RequestStatus::Aborted));
    }

    #[test]
    fn empty_request_is_completed() {
        assert_eq!(derive_request_status(&[]), RequestStatus::Completed);
    }

    fn status_strategy() -> impl Strategy<Value = HostRoleStatus> {
        prop::sample::select(HostRoleStatus::ALL.to_vec())
    }

    fn stage_strategy() -> impl Strategy<Value = (bool, Vec<HostRoleStatus>)> {
        (any::<bool>(), prop::collection::vec(status_strategy(), 1..6))
    }

    proptest! {
        /// El estado agregado coincide con la regla escrita a mano.
        #[test]
        fn request_status_matches_rule(stages in prop::collection::vec(stage_strategy(), 1..5)) {
            let summaries: Vec<StageSummary> = stages
                .iter()
                .map(|(skippable, statuses)| StageSummary::from_statuses(*skippable, statuses.iter().copied()))
                .collect();

            let all_completed = stages.iter().all(|(_, s)| s.iter().all(|t| *t == Completed));
            let fatal = stages
                .iter()
                .any(|(skippable, s)| !skippable && s.iter().any(|t| matches!(t, Failed | Aborted)));
            let all_terminal = stages
                .iter()
                .all(|(_, s)| s.iter().all(|t| matches!(t, Completed | Failed | Aborted)));

            let expected = if all_completed {
                RequestStatus::Completed
            } else if fatal {
                RequestStatus::Failed
            } else if all_terminal {
                RequestStatus::SkippedFailed
            } else {
                RequestStatus::InProgress
            };

            prop_assert_eq!(derive_request_status(&summaries), expected);
            prop_assert_eq!(expected == RequestStatus::Completed, all_completed);
        }
    }
}
