pub mod config_cmd;
pub mod output;
pub mod providers_cmd;
pub mod usage_cmd;
