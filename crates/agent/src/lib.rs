//! Adapter over one coding-agent CLI subprocess.
//!
//! The CLI is a black box with a line-framed JSON contract: requests go in
//! on stdin (`{"op":"user","text":…}`, `{"op":"command",…}`,
//! `{"op":"interrupt"}`), events come out on stdout in the same namespace
//! as [`SessionEvent`] plus `status` lines. The subprocess exits when its
//! stdin closes, which is why the pool only ever drops its handle instead
//! of driving shutdown (see `stop`).

mod session;
mod wire;

pub use session::{AgentSession, SessionStatus, START_TIMEOUT_SECS};
