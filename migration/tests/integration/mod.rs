mod inventory_test;
mod job_test;
mod preparer_test;
mod resume_test;
