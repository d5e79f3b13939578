//! JSON request/response types for the web API.
//!
//! All types live in the `novadrill` lib so other clients can share them.

pub use novadrill::{
    CreateDrillRequest, CreateDrillResponse, DrillCategory, DrillListResponse, DrillSummary,
    PostSettingsResponse, ShotRequest, StartDrillRequest, StatusResponse, TestRunRequest,
};
