pub mod ports;
pub mod run;
pub mod tone_server;
