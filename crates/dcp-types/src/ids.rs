//! Relative-resource identity values.
//!
//! Canonical string form: `projects/<p>/jobConfigs/<c>/jobRuns/<r>/tasks/<t>`.
//! `<t>` (the task id) is the only segment allowed to contain the `/`
//! separator itself, since task ids are often derived from source paths.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdError {
    #[error("identity string is empty")]
    Empty,
    #[error("expected segment '{expected}' at position {position}, got '{found}'")]
    UnexpectedSegment {
        expected: &'static str,
        position: usize,
        found: String,
    },
    #[error("segment '{segment}' must not be empty")]
    EmptySegment { segment: &'static str },
    #[error("malformed identity string: '{0}'")]
    Malformed(String),
}

/// `projects/<p>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProjectId {
    pub project: String,
}

impl ProjectId {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
        }
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "projects/{}", self.project)
    }
}

impl FromStr for ProjectId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = Segments::new(s)?;
        let project = parts.take_segment("projects")?;
        parts.finish()?;
        Ok(Self { project })
    }
}

/// `projects/<p>/jobConfigs/<c>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobConfigId {
    pub project: String,
    pub config_id: String,
}

impl JobConfigId {
    pub fn new(project: impl Into<String>, config_id: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            config_id: config_id.into(),
        }
    }

    pub fn project_id(&self) -> ProjectId {
        ProjectId::new(self.project.clone())
    }
}

impl fmt::Display for JobConfigId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "projects/{}/jobConfigs/{}",
            self.project, self.config_id
        )
    }
}

impl FromStr for JobConfigId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = Segments::new(s)?;
        let project = parts.take_segment("projects")?;
        let config_id = parts.take_segment("jobConfigs")?;
        parts.finish()?;
        Ok(Self { project, config_id })
    }
}

/// `projects/<p>/jobConfigs/<c>/jobRuns/<r>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobRunId {
    pub project: String,
    pub config_id: String,
    pub run_id: String,
}

impl JobRunId {
    pub fn new(
        project: impl Into<String>,
        config_id: impl Into<String>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            config_id: config_id.into(),
            run_id: run_id.into(),
        }
    }

    pub fn job_config_id(&self) -> JobConfigId {
        JobConfigId::new(self.project.clone(), self.config_id.clone())
    }
}

impl fmt::Display for JobRunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "projects/{}/jobConfigs/{}/jobRuns/{}",
            self.project, self.config_id, self.run_id
        )
    }
}

impl FromStr for JobRunId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = Segments::new(s)?;
        let project = parts.take_segment("projects")?;
        let config_id = parts.take_segment("jobConfigs")?;
        let run_id = parts.take_segment("jobRuns")?;
        parts.finish()?;
        Ok(Self {
            project,
            config_id,
            run_id,
        })
    }
}

/// `projects/<p>/jobConfigs/<c>/jobRuns/<r>/tasks/<t>`
///
/// `task_id` is permitted to contain `/`, so it greedily consumes the
/// remainder of the string after the `tasks/` marker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId {
    pub project: String,
    pub config_id: String,
    pub run_id: String,
    pub task_id: String,
}

impl TaskId {
    pub fn new(
        project: impl Into<String>,
        config_id: impl Into<String>,
        run_id: impl Into<String>,
        task_id: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            config_id: config_id.into(),
            run_id: run_id.into(),
            task_id: task_id.into(),
        }
    }

    pub fn job_run_id(&self) -> JobRunId {
        JobRunId::new(
            self.project.clone(),
            self.config_id.clone(),
            self.run_id.clone(),
        )
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "projects/{}/jobConfigs/{}/jobRuns/{}/tasks/{}",
            self.project, self.config_id, self.run_id, self.task_id
        )
    }
}

impl FromStr for TaskId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = Segments::new(s)?;
        let project = parts.take_segment("projects")?;
        let config_id = parts.take_segment("jobConfigs")?;
        let run_id = parts.take_segment("jobRuns")?;
        let task_id = parts.take_remainder("tasks")?;
        Ok(Self {
            project,
            config_id,
            run_id,
            task_id,
        })
    }
}

/// Small cursor over `/`-delimited segments that enforces the
/// `<marker>/<value>` pairing used by every identity kind above.
struct Segments<'a> {
    rest: &'a str,
    position: usize,
}

impl<'a> Segments<'a> {
    fn new(s: &'a str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        Ok(Self { rest: s, position: 0 })
    }

    /// Consume `<marker>/<value>` where `<value>` does not contain `/`.
    fn take_segment(&mut self, marker: &'static str) -> Result<String, IdError> {
        let prefix = format!("{marker}/");
        if !self.rest.starts_with(&prefix) {
            let found = self.rest.split('/').next().unwrap_or(self.rest);
            return Err(IdError::UnexpectedSegment {
                expected: marker,
                position: self.position,
                found: found.to_string(),
            });
        }
        self.rest = &self.rest[prefix.len()..];
        self.position += 1;

        let value_end = self.rest.find('/').unwrap_or(self.rest.len());
        let value = &self.rest[..value_end];
        if value.is_empty() {
            return Err(IdError::EmptySegment { segment: marker });
        }
        self.rest = &self.rest[value_end..];
        self.rest = self.rest.strip_prefix('/').unwrap_or(self.rest);
        Ok(value.to_string())
    }

    /// Consume `<marker>/<remainder>` where `<remainder>` is everything left
    /// and may itself contain `/`.
    fn take_remainder(&mut self, marker: &'static str) -> Result<String, IdError> {
        let prefix = format!("{marker}/");
        if !self.rest.starts_with(&prefix) {
            let found = self.rest.split('/').next().unwrap_or(self.rest);
            return Err(IdError::UnexpectedSegment {
                expected: marker,
                position: self.position,
                found: found.to_string(),
            });
        }
        let value = &self.rest[prefix.len()..];
        if value.is_empty() {
            return Err(IdError::EmptySegment { segment: marker });
        }
        self.rest = "";
        Ok(value.to_string())
    }

    fn finish(self) -> Result<(), IdError> {
        if self.rest.is_empty() {
            Ok(())
        } else {
            Err(IdError::Malformed(self.rest.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_task_id() {
        let s = "projects/acme/jobConfigs/cfg1/jobRuns/run1/tasks/copy/file/a.txt";
        let id: TaskId = s.parse().unwrap();
        assert_eq!(id.project, "acme");
        assert_eq!(id.config_id, "cfg1");
        assert_eq!(id.run_id, "run1");
        assert_eq!(id.task_id, "copy/file/a.txt");
        assert_eq!(id.to_string(), s);
    }

    #[test]
    fn round_trips_job_run_id() {
        let s = "projects/acme/jobConfigs/cfg1/jobRuns/run1";
        let id: JobRunId = s.parse().unwrap();
        assert_eq!(id.to_string(), s);
    }

    #[test]
    fn rejects_wrong_marker() {
        let err = "jobConfigs/acme/jobRuns/run1".parse::<JobRunId>().unwrap_err();
        assert!(matches!(err, IdError::UnexpectedSegment { expected: "projects", .. }));
    }

    #[test]
    fn rejects_empty_segment() {
        let err = "projects//jobConfigs/c".parse::<JobConfigId>().unwrap_err();
        assert!(matches!(err, IdError::EmptySegment { segment: "projects" }));
    }

    #[test]
    fn rejects_trailing_garbage_on_non_task_id() {
        let err = "projects/acme/jobConfigs/c/jobRuns/r/extra"
            .parse::<JobRunId>()
            .unwrap_err();
        assert!(matches!(err, IdError::Malformed(_)));
    }

    #[test]
    fn rejects_empty_string() {
        assert_eq!("".parse::<TaskId>().unwrap_err(), IdError::Empty);
    }

    #[test]
    fn task_id_derives_parent_job_run_id() {
        let task: TaskId = "projects/p/jobConfigs/c/jobRuns/r/tasks/t".parse().unwrap();
        assert_eq!(task.job_run_id().to_string(), "projects/p/jobConfigs/c/jobRuns/r");
    }
}
