pub mod advisory_lock;
pub mod poll_jobs;
pub mod registration;
