pub const SUCCESS: i32 = 0;
pub const EXECUTION_ERROR: i32 = 1;
/// Invalid configuration or arguments not caught by clap
pub const INPUT_ERROR: i32 = 2;
/// The frame source or serial port could not be opened
pub const SOURCE_UNAVAILABLE: i32 = 3;
