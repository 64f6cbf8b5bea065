//! udfbox: sandboxed bring-your-own-binary UDF execution
//!
//! Callers hand the service an opaque native executable; the service runs
//! it in isolated worker processes and speaks a size-delimited
//! request/response protocol with each one:
//!
//! - **Load** - the binary is materialized with exec permissions and a
//!   warm pool of identical workers is spawned, each in its own
//!   mount/PID/IPC/UTS namespaces behind a pivot root
//! - **Execute** - an idle worker receives one framed request on its
//!   per-call socket and answers with one framed response; the worker is
//!   consumed and a replacement is respawned
//! - **Cancel / deadline** - the assigned worker is killed; the caller's
//!   callback fires with the terminal state, exactly once
//! - **Delete** - every worker under the code token is killed, reaped and
//!   its pivot root removed
//!
//! ## Quick Start
//!
//! ```ignore
//! use udfbox::{BinarySource, Config, ExecuteRequest, UdfService};
//!
//! let service = UdfService::new(Config::default())?;
//! let token = service.load_binary(BinarySource::Bytes(&bytes), 4, false)?;
//! service.execute(
//!     ExecuteRequest::new(token, b"request".to_vec()),
//!     |completion| println!("{:?}", completion.result),
//!     None,
//! );
//! ```
//!
//! ## Worker contract
//!
//! The binary is launched with `argv[1]` holding the decimal number of a
//! connected stream socket. It reads one length-prefixed request from
//! that descriptor ([`frame`]), writes one length-prefixed response, and
//! exits. Workers are never reused.
//!
//! ## Requirements
//!
//! - Linux with namespace privileges for worker isolation
//! - Optionally an external sandboxing monitor (gVisor) in front of the
//!   workers; see [`SandboxMode`]

pub mod config;
pub mod error;
pub mod frame;
pub mod service;
pub mod token;

mod artifact;
mod control;
mod dispatch;
mod logs;
mod pool;
mod registry;
mod threadpool;
mod worker;

pub use config::{Config, SandboxMode};
pub use control::ControlError;
pub use error::{InvocationError, LoadError, LogError};
pub use frame::{FrameDecoder, FrameError, FrameWriter, DEFAULT_MAX_FRAME_LEN};
pub use pool::PoolStats;
pub use service::{
    BinarySource, Completion, ExecuteRequest, LogsFn, ResponseFn, UdfService,
};
pub use token::{CodeToken, ExecutionToken, TOKEN_LEN};
