pub mod persistent;
pub mod pty;
pub mod scrollback;
pub mod tmux;
