use k8s_openapi::api::batch::v1::Job;

/// How a job finished.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Completion {
    Succeeded,
    Failed,
}

impl Completion {
    /// Returns how the job finished, or `None` while it is still running. A
    /// job is finished once its `Complete` or `Failed` condition holds.
    pub fn of(job: &Job) -> Option<Self> {
        let conditions = job.status.as_ref()?.conditions.as_ref()?;
        conditions
            .iter()
            .filter(|c| c.status == "True")
            .find_map(|c| match c.type_.as_str() {
                "Complete" => Some(Self::Succeeded),
                "Failed" => Some(Self::Failed),
                _ => None,
            })
    }
}
