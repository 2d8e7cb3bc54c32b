//! AutoMine harness: the simulated voxel world, the fleet runner, and the
//! pieces the operator CLI is built from.

pub mod fleet;
pub mod report;
pub mod sim;
pub mod wizard;

pub use fleet::{FleetConfig, FleetRunner};
pub use report::{AgentReport, FleetReport};
pub use sim::{SimConfig, SimHandle, SimWorld};
