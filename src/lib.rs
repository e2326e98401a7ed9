//! ==============================================================================
//! meshlink-gateway - mesh / wifi gateway orchestrator
//! ==============================================================================
//!
//! purpose:
//!     a gateway node that collects sensor readings from a low-power mesh and
//!     forwards them to an http endpoint over wifi. both radios share one rf
//!     front-end, so the gateway time-shares it: mesh most of the time, wifi
//!     once per alternation period.
//!
//! layout:
//!
//! ```text
//!     ┌──────────────────────────────────────────────────────────────┐
//!     │                  scheduler (alternation cycle)                │
//!     └──────────────────────────────┬───────────────────────────────┘
//!                                    │ enable / disable
//!     ┌──────────────┬───────────────┼───────────────┬──────────────┐
//!     │ mesh worker  │  wifi worker  │  http egress  │ sensor worker│
//!     └──────┬───────┴───────┬───────┴───────┬───────┴──────┬───────┘
//!            │ ingress       │ radio lease   │ egress       │ own reading
//!            ▼               ▼               ▼              ▼
//!     ┌──────────────────────────────────────────────────────────────┐
//!     │   shared state: node table, own reading, rf arbiter          │
//!     └──────────────────────────────────────────────────────────────┘
//!
//! ```
//! ==============================================================================

pub mod coap;
pub mod codec;
pub mod config;
pub mod domain;
pub mod egress;
pub mod error;
pub mod hal;
pub mod ingress;
pub mod manager;
pub mod mesh;
pub mod node_table;
pub mod radio;
pub mod scheduler;
pub mod sensors;
pub mod status;
pub mod subsystem;
pub mod wifi;
pub mod workers;
