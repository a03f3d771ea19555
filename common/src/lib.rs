pub mod agent;
pub mod api;
pub mod error;
pub mod request;
pub mod role;
pub mod role_command_order;
pub mod role_graph;
pub mod stage;
pub mod status;
pub mod task;
pub mod topology;

pub use agent::{
    AgentCommand, AgentHeartbeatRequest, AgentHeartbeatResponse, AgentRegisterRequest,
    AgentRegisterResponse, CommandReport, CommandsRequest, CommandsResponse, HostMetrics,
    HostState, ReportStatus, ReportsRequest, ReportsResponse,
};
pub use api::{
    AbortResponse, ErrorBody, ExecuteActionRequest, RequestListQuery, RequestStatusReport,
    RequestSummary, ResourceFilter, SubmitRequest, SubmitResponse,
};
pub use error::PlanError;
pub use request::{PlannedStage, Request, RequestId, RequestStageContainer, TimeoutDefaults};
pub use role::{Role, RoleCommand, RoleCommandPair};
pub use role_command_order::{OrderError, RoleCommandOrder};
pub use role_graph::{GraphCycleError, RoleGraph};
pub use stage::{Stage, StageId, StagePlan};
pub use status::{
    derive_aborted_request_status, derive_request_status, HostRoleStatus, InvalidTransition,
    RequestStatus, StageSummary,
};
pub use task::{CommandPayload, CommandSpec, HostRoleCommand, TaskId, TaskShortStatus};
pub use topology::{ClusterHostInfo, ClusterTopology, ComponentState, HostName};
