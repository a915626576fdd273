//! Build step: turns a build context into per-platform artifact bytes.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;

use super::{BuildOutput, Platform, PlatformArtifact};
use crate::errors::PublishError;
use crate::revision::Revision;

/// Produces artifact variants for a revision. Implementations must not touch
/// the registry; a failed build leaves no trace remotely.
#[async_trait]
pub trait Builder: Send + Sync {
    async fn build(
        &self,
        revision: &Revision,
        context: &Path,
        platforms: &[Platform],
    ) -> Result<BuildOutput, PublishError>;
}

/// Runs an external build tool once per platform.
///
/// The command template is executed through `sh -c` inside the build context
/// with `{context}`, `{platform}`, `{output}` and `{revision}` substituted.
/// The tool must write the artifact for that platform to `{output}`.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    template: String,
    work_dir: PathBuf,
    timeout: Duration,
}

impl CommandBuilder {
    pub fn new(template: impl Into<String>, work_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            template: template.into(),
            work_dir: work_dir.into(),
            timeout,
        }
    }

    /// Concrete command line for one platform.
    pub fn render(&self, revision: &Revision, context: &Path, platform: &Platform, output: &Path) -> String {
        self.template
            .replace("{context}", &context.display().to_string())
            .replace("{platform}", &platform.to_string())
            .replace("{output}", &output.display().to_string())
            .replace("{revision}", revision.as_str())
    }

    async fn build_one(
        &self,
        revision: &Revision,
        context: &Path,
        platform: &Platform,
    ) -> Result<PlatformArtifact, PublishError> {
        let build_err = |message: String| PublishError::Build {
            platform: platform.to_string(),
            message,
        };

        std::fs::create_dir_all(&self.work_dir)
            .map_err(|e| build_err(format!("cannot create {}: {}", self.work_dir.display(), e)))?;
        let output_path = self
            .work_dir
            .join(format!("{}-{}.tar", revision, platform.slug()));
        let _ = std::fs::remove_file(&output_path);

        let command = self.render(revision, context, platform, &output_path);
        tracing::info!(platform = %platform, command = %command, "building");

        let child = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .current_dir(context)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("PROMOTE_REVISION", revision.as_str())
            .env("PROMOTE_PLATFORM", platform.to_string())
            .env("PROMOTE_OUTPUT", &output_path)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| build_err(format!("failed to spawn build command: {}", e)))?;

        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| build_err(format!("failed to wait for build: {}", e)))?,
            Err(_) => return Err(build_err(format!("build timed out after {:?}", self.timeout))),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: Vec<&str> = stderr.lines().rev().take(20).collect();
            let tail: Vec<&str> = tail.into_iter().rev().collect();
            return Err(build_err(format!(
                "exit code {}: {}",
                output.status.code().unwrap_or(-1),
                tail.join("\n")
            )));
        }

        let bytes = std::fs::read(&output_path).map_err(|e| {
            build_err(format!(
                "build succeeded but wrote no artifact to {}: {}",
                output_path.display(),
                e
            ))
        })?;
        if bytes.is_empty() {
            return Err(build_err("build produced an empty artifact".to_string()));
        }
        let _ = std::fs::remove_file(&output_path);

        let variant = PlatformArtifact::new(platform.clone(), bytes);
        tracing::debug!(platform = %platform, digest = %variant.digest, size = variant.bytes.len(), "built");
        Ok(variant)
    }
}

#[async_trait]
impl Builder for CommandBuilder {
    async fn build(
        &self,
        revision: &Revision,
        context: &Path,
        platforms: &[Platform],
    ) -> Result<BuildOutput, PublishError> {
        if !context.is_dir() {
            return Err(PublishError::Build {
                platform: "-".to_string(),
                message: format!("build context {} is not a directory", context.display()),
            });
        }
        let mut variants = Vec::with_capacity(platforms.len());
        for platform in platforms {
            variants.push(self.build_one(revision, context, platform).await?);
        }
        Ok(BuildOutput::new(variants))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rev() -> Revision {
        Revision::parse("abc1234").unwrap()
    }

    fn amd64() -> Platform {
        "linux/amd64".parse().unwrap()
    }

    #[test]
    fn test_render_substitutes_placeholders() {
        let builder = CommandBuilder::new(
            "tool build --platform {platform} -o {output} {context} # {revision}",
            "/tmp/out",
            Duration::from_secs(5),
        );
        let rendered = builder.render(&rev(), Path::new("/src"), &amd64(), Path::new("/tmp/out/x.tar"));
        assert_eq!(
            rendered,
            "tool build --platform linux/amd64 -o /tmp/out/x.tar /src # abc1234"
        );
    }

    #[tokio::test]
    async fn test_successful_build_reads_output() {
        let ctx = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let builder = CommandBuilder::new(
            "printf '%s' \"$PROMOTE_PLATFORM\" > {output}",
            out.path(),
            Duration::from_secs(10),
        );
        let output = builder.build(&rev(), ctx.path(), &[amd64()]).await.unwrap();
        assert_eq!(output.variants().len(), 1);
        assert_eq!(output.variants()[0].bytes, b"linux/amd64");
    }

    #[tokio::test]
    async fn test_failing_command_is_build_failure() {
        let ctx = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let builder = CommandBuilder::new("echo broken >&2; exit 3", out.path(), Duration::from_secs(10));
        let err = builder.build(&rev(), ctx.path(), &[amd64()]).await.unwrap_err();
        match err {
            PublishError::Build { platform, message } => {
                assert_eq!(platform, "linux/amd64");
                assert!(message.contains("exit code 3"));
                assert!(message.contains("broken"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_output_is_build_failure() {
        let ctx = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let builder = CommandBuilder::new("true", out.path(), Duration::from_secs(10));
        let err = builder.build(&rev(), ctx.path(), &[amd64()]).await.unwrap_err();
        assert!(matches!(err, PublishError::Build { .. }));
    }

    #[tokio::test]
    async fn test_slow_build_times_out() {
        let ctx = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let builder = CommandBuilder::new("sleep 5", out.path(), Duration::from_millis(100));
        let err = builder.build(&rev(), ctx.path(), &[amd64()]).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_missing_context_is_build_failure() {
        let out = tempfile::tempdir().unwrap();
        let builder = CommandBuilder::new("true", out.path(), Duration::from_secs(1));
        let err = builder
            .build(&rev(), Path::new("/definitely/not/here"), &[amd64()])
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Build { .. }));
    }
}
