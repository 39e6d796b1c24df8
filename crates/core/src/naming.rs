//! Blob key naming.
//!
//! Every delivery of a job writes under
//! `{prefix}/{job_id}/{job_id}-{rand}[-{index}][.out]`. The random part
//! is drawn per delivery so a redelivered job never overwrites the
//! artifacts of an earlier attempt.

/// Suffix of the status object written next to the artifacts.
pub const STATUS_SUFFIX: &str = ".out";

/// Length of the random hex tag in object names.
const RANDOM_TAG_LEN: usize = 4;

/// Join the producer prefix with the job id.
///
/// A prefix that already ends in `/` is not given a second separator.
pub fn output_prefix(prefix: Option<&str>, job_id: &str) -> String {
    match prefix {
        Some(p) if !p.is_empty() => {
            if p.ends_with('/') {
                format!("{p}{job_id}")
            } else {
                format!("{p}/{job_id}")
            }
        }
        _ => job_id.to_string(),
    }
}

/// Four lowercase hex characters taken from a fresh v4 UUID.
pub fn random_tag() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..RANDOM_TAG_LEN].to_string()
}

/// Key layout for one delivery of one job.
#[derive(Debug, Clone)]
pub struct BlobKeys {
    prefix: String,
    stem: String,
}

impl BlobKeys {
    pub fn new(prefix: impl Into<String>, job_id: &str, tag: &str) -> Self {
        Self {
            prefix: prefix.into(),
            stem: format!("{job_id}-{tag}"),
        }
    }

    /// Key of the `index`-th artifact. Indices are 1-based.
    pub fn artifact(&self, index: usize) -> String {
        format!("{}/{}-{index}", self.prefix, self.stem)
    }

    /// Key of the status object.
    pub fn status(&self) -> String {
        format!("{}/{}{STATUS_SUFFIX}", self.prefix, self.stem)
    }
}
