pub mod format;
pub mod log_file;
pub mod sos;
