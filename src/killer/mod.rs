// Process killer module

mod pidfd;
mod selector;
pub mod signals;

pub use pidfd::PidFd;
pub use selector::{Candidate, Victim, VictimSelector, OOM_SCORE_ADJ_MIN, PROTECTED_PID_FLOOR};
pub use signals::{KillCoordinator, KillResult, ProcessControl, SystemControl, Target};
