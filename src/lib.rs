/*!
vibeproxy: a thinking-budget rewriting reverse proxy paired with a
single-instance supervisor for the backend API process it fronts.

- `proxy`: HTTP/1.x request parsing, the JSON thinking-budget transform,
  forwarding and byte-level response relay.
- `supervisor`: backend process lifecycle, output capture, health probe and
  auxiliary authentication jobs.
- `logbuf`: bounded in-memory log store shared with status consumers.
- `config`, `lock`, `telemetry`, `color`: ambient plumbing for the binary.
*/

mod color;
pub mod config;
mod errors;
mod lock;
pub mod logbuf;
pub mod proxy;
pub mod supervisor;
pub mod telemetry;

pub use color::*;
pub use errors::*;
pub use lock::*;
pub use logbuf::{LogStore, RingBuffer};
pub use proxy::ThinkingProxy;
pub use supervisor::{BackendState, JobKind, JobOutcome, StopKind, Supervisor};
