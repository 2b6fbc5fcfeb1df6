//! SmartSession: students stream sampled camera frames to an analysis relay;
//! teacher dashboards receive a continuously reconciled view of every
//! student's latest analysis.
//!
//! Client side: [`student::StudentSession`] (capture role) and
//! [`dashboard::DashboardAggregator`] (observer role), both built on
//! [`connection::ConnectionManager`]. Relay side: [`routes::router`].

pub mod analyzer;
pub mod config;
pub mod connection;
pub mod dashboard;
pub mod error;
pub mod models;
pub mod routes;
pub mod sampler;
pub mod source;
pub mod state;
pub mod student;
pub mod transport;

pub use config::Config;
pub use connection::ConnectionManager;
pub use dashboard::{DashboardAggregator, DashboardView};
pub use error::SessionError;
pub use models::{AnalysisResult, AnalysisStatus, ConnectionState, Role, Session, StudentState};
pub use student::StudentSession;
