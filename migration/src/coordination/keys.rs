//! Layout of the registry tree.
//!
//! ```text
//! /pipeline/jobs/{job_id}/config
//! /pipeline/jobs/{job_id}/info
//! /pipeline/jobs/{job_id}/offsets/{item}
//! /pipeline/jobs/{job_id}/check/result
//! /pipeline/jobs/{job_id}/barrier/{milestone}/{item}
//! /pipeline/locks/{job_id}
//! ```

const JOBS_ROOT: &str = "/pipeline/jobs";
const LOCKS_ROOT: &str = "/pipeline/locks";

pub fn jobs_root() -> &'static str {
    JOBS_ROOT
}

pub fn job_root(job_id: &str) -> String {
    format!("{JOBS_ROOT}/{job_id}")
}

pub fn job_config(job_id: &str) -> String {
    format!("{JOBS_ROOT}/{job_id}/config")
}

pub fn job_info(job_id: &str) -> String {
    format!("{JOBS_ROOT}/{job_id}/info")
}

pub fn job_offsets(job_id: &str) -> String {
    format!("{JOBS_ROOT}/{job_id}/offsets")
}

pub fn job_offset(job_id: &str, item: u32) -> String {
    format!("{JOBS_ROOT}/{job_id}/offsets/{item}")
}

pub fn check_root(job_id: &str) -> String {
    format!("{JOBS_ROOT}/{job_id}/check")
}

pub fn check_result(job_id: &str) -> String {
    format!("{JOBS_ROOT}/{job_id}/check/result")
}

pub fn barrier(job_id: &str, milestone: &str) -> String {
    format!("{JOBS_ROOT}/{job_id}/barrier/{milestone}")
}

pub fn barrier_item(job_id: &str, milestone: &str, item: u32) -> String {
    format!("{JOBS_ROOT}/{job_id}/barrier/{milestone}/{item}")
}

pub fn lock(job_id: &str) -> String {
    format!("{LOCKS_ROOT}/{job_id}")
}
