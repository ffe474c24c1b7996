//! Write-path sandbox: command deny-lists, role-scoped filesystem
//! authorization, and optional namespace isolation for agent subprocesses.

mod deny;
mod guard;
mod wrap;

pub use deny::{blocked_git_command, blocked_shell_command};
pub use guard::WriteGuard;
pub use wrap::wrap_command;
