//! Supervision runtime for process-pilot: child handles, readiness
//! probing, the monitor loop, and the supervisor façade.

pub mod child;
pub mod cli;
pub mod clock;
pub mod graph_render;
pub mod hooks;
pub mod monitor;
pub mod probe;
pub mod stats;
pub mod supervisor;

pub use child::{ChildHandle, StopOutcome};
pub use monitor::MonitorExit;
pub use probe::{ProbeVerdict, ReadinessProber};
pub use supervisor::{PilotOptions, ProcessPilot};
