pub mod cmd;
pub(crate) mod controller;
