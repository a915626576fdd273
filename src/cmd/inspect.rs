//! Offline inspection commands — `promote identify`, `promote compose` and
//! `promote report`.

use anyhow::{Context, Result, bail};
use console::style;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use promote::compose::{Document, compose};
use promote::config::Config;
use promote::coordinator::RunReport;
use promote::errors::{Classify, EXIT_OK};
use promote::publish::ArtifactRef;
use promote::revision::{RevisionIdentifier, Trigger};

pub fn cmd_identify(project_dir: &Path, revision: Option<&str>, context: &Path) -> Result<i32> {
    let config = Config::new(project_dir.to_path_buf())?;
    let identifier = RevisionIdentifier::new(config.toml.revision.abbrev_len);
    let trigger = Trigger::new(revision, config.resolve(context), &config.toml.lane.name);

    match identifier.identify(&trigger) {
        Ok(revision) => {
            println!("{}", revision);
            Ok(EXIT_OK)
        }
        Err(e) => {
            eprintln!("{} {}", style("error:").red().bold(), e);
            Ok(e.kind().exit_code())
        }
    }
}

pub fn cmd_compose(document: &Path, artifact: &str) -> Result<i32> {
    let artifact = parse_artifact(artifact)?;
    let content = std::fs::read_to_string(document)
        .with_context(|| format!("Failed to read document: {}", document.display()))?;
    let document = Document::new(document.display().to_string(), content);

    match compose(&document, &artifact) {
        Ok(diff) if diff.is_empty() => {
            println!("{} already references {}", document.path, artifact.reference());
            Ok(EXIT_OK)
        }
        Ok(diff) => {
            print!("{}", diff.render());
            Ok(EXIT_OK)
        }
        Err(e) => {
            eprintln!("{} {}", style("error:").red().bold(), e);
            Ok(e.kind().exit_code())
        }
    }
}

/// `repository:tag`, where the tag is whatever follows the last `:` after
/// the last `/` (so registry ports are not mistaken for tags).
fn parse_artifact(raw: &str) -> Result<ArtifactRef> {
    let raw = raw.trim();
    let name_start = raw.rfind('/').map_or(0, |i| i + 1);
    let Some(colon) = raw[name_start..].rfind(':').map(|i| name_start + i) else {
        bail!("Invalid artifact '{}': expected repository:tag", raw);
    };
    let (repository, tag) = (&raw[..colon], &raw[colon + 1..]);
    if repository.is_empty() || tag.is_empty() {
        bail!("Invalid artifact '{}': expected repository:tag", raw);
    }
    Ok(ArtifactRef {
        repository: repository.to_string(),
        tag: tag.to_string(),
        platforms: BTreeSet::new(),
        digest: String::new(),
    })
}

pub fn cmd_report(project_dir: &Path, revision: Option<&str>) -> Result<i32> {
    let config = Config::new(project_dir.to_path_buf())?;
    let runs_dir = config.runs_dir();

    if let Some(revision) = revision {
        let report = RunReport::load(&runs_dir.join(format!("{}.json", revision)))?;
        print!("{}", report.summary());
        if let Some(diff) = report.diff.as_ref().filter(|d| !d.is_empty()) {
            println!();
            print!("{}", diff.render());
        }
        return Ok(EXIT_OK);
    }

    let mut reports = Vec::new();
    for path in report_files(&runs_dir)? {
        match RunReport::load(&path) {
            Ok(report) => reports.push(report),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable report"),
        }
    }
    if reports.is_empty() {
        println!("No run reports in {}", runs_dir.display());
        return Ok(EXIT_OK);
    }

    reports.sort_by_key(|r| r.finished_at);
    for report in reports.iter().rev() {
        let revision = report
            .revision
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<20} {:<12} {:<28} {}",
            revision,
            report.lane,
            report.outcome.to_string(),
            style(report.finished_at.format("%Y-%m-%d %H:%M:%S")).dim()
        );
    }
    Ok(EXIT_OK)
}

fn report_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read report directory: {}", dir.display()))?
    {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_artifact() {
        let artifact = parse_artifact("registry.example.com/team/myapp:abc1234").unwrap();
        assert_eq!(artifact.repository, "registry.example.com/team/myapp");
        assert_eq!(artifact.tag, "abc1234");

        let artifact = parse_artifact("localhost:5000/myapp:def5678").unwrap();
        assert_eq!(artifact.repository, "localhost:5000/myapp");
        assert_eq!(artifact.tag, "def5678");
    }

    #[test]
    fn test_parse_artifact_requires_tag() {
        assert!(parse_artifact("localhost:5000/myapp").is_err());
        assert!(parse_artifact("myapp:").is_err());
        assert!(parse_artifact(":abc").is_err());
    }
}
