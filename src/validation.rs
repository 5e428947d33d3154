// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Job name validation, ported from the upstream `ValidateName` check.

use regex::Regex;
use std::sync::OnceLock;

static NAME_RE: OnceLock<Regex> = OnceLock::new();

fn name_regex() -> &'static Regex {
    NAME_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").unwrap())
}

pub fn validate_job_name(name: &str) -> Result<(), String> {
    if name_regex().is_match(name) {
        Ok(())
    } else {
        Err(format!(
            "invalid field value: {}, must match regex ^[A-Za-z0-9][A-Za-z0-9_.-]*$",
            name
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_names() {
        assert!(validate_job_name("my-job_1.0").is_ok());
        assert!(validate_job_name("a").is_ok());
    }

    #[test]
    fn rejects_leading_punctuation() {
        assert!(validate_job_name("-job").is_err());
        assert!(validate_job_name(".job").is_err());
    }

    #[test]
    fn rejects_invalid_characters() {
        assert!(validate_job_name("job name").is_err());
        assert!(validate_job_name("job/name").is_err());
    }

    #[test]
    fn rejects_empty() {
        assert!(validate_job_name("").is_err());
    }
}
