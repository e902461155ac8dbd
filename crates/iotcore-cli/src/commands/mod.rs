pub mod broker_cmd;
pub mod run_cmd;
