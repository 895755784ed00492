//! One module per subcommand.

pub mod apply;
pub mod audit_cmd;
pub mod credential;
pub mod current;
pub mod diff;
pub mod discard;
pub mod history;
pub mod rollback;
pub mod rotate;
pub mod stage;
pub mod validate;
