//! Context and filesystem steps: cwd, env, debug, tmpdir, mkdir, rm

use std::path::PathBuf;

use async_trait::async_trait;

use crate::chain::Step;
use crate::context::RunnerContext;
use crate::error::{ChainError, ErrorKind};

// ──────────────────────────────────────────────────────────
// cwd — change the working directory
// ──────────────────────────────────────────────────────────

pub(crate) struct CwdStep(pub PathBuf);

#[async_trait]
impl Step for CwdStep {
    fn name(&self) -> &str {
        "cwd"
    }

    fn describe(&self) -> String {
        format!("cwd {}", self.0.display())
    }

    async fn run(&self, ctx: &mut RunnerContext) -> Result<(), ChainError> {
        ctx.cwd = ctx.resolve(&self.0);
        Ok(())
    }
}

// ──────────────────────────────────────────────────────────
// env — set a variable for later processes
// ──────────────────────────────────────────────────────────

pub(crate) struct EnvStep(pub String, pub String);

#[async_trait]
impl Step for EnvStep {
    fn name(&self) -> &str {
        "env"
    }

    fn describe(&self) -> String {
        format!("env {}={}", self.0, self.1)
    }

    async fn run(&self, ctx: &mut RunnerContext) -> Result<(), ChainError> {
        ctx.env.insert(self.0.clone(), self.1.clone());
        Ok(())
    }
}

// ──────────────────────────────────────────────────────────
// debug — echo process output
// ──────────────────────────────────────────────────────────

pub(crate) struct DebugStep;

#[async_trait]
impl Step for DebugStep {
    fn name(&self) -> &str {
        "debug"
    }

    async fn run(&self, ctx: &mut RunnerContext) -> Result<(), ChainError> {
        ctx.debug = true;
        if let Some(proc) = ctx.proc.as_mut() {
            proc.debug();
        }
        Ok(())
    }
}

// ──────────────────────────────────────────────────────────
// tmpdir — switch to a fresh temporary directory
// ──────────────────────────────────────────────────────────

pub(crate) struct TmpdirStep;

#[async_trait]
impl Step for TmpdirStep {
    fn name(&self) -> &str {
        "tmpdir"
    }

    async fn run(&self, ctx: &mut RunnerContext) -> Result<(), ChainError> {
        let dir = tempfile::Builder::new()
            .prefix("emx-clitest-")
            .tempdir()
            .map_err(|e| ChainError::new(ErrorKind::Io, format!("tmpdir: {}", e)))?;
        ctx.cwd = dir.path().to_path_buf();
        ctx.logf(&format!("[cwd {}]", ctx.cwd.display()));
        ctx.workdir = Some(dir);
        Ok(())
    }
}

// ──────────────────────────────────────────────────────────
// mkdir — create a directory and its parents
// ──────────────────────────────────────────────────────────

pub(crate) struct MkdirStep(pub PathBuf);

#[async_trait]
impl Step for MkdirStep {
    fn name(&self) -> &str {
        "mkdir"
    }

    fn describe(&self) -> String {
        format!("mkdir {}", self.0.display())
    }

    async fn run(&self, ctx: &mut RunnerContext) -> Result<(), ChainError> {
        let path = ctx.resolve(&self.0);
        tokio::fs::create_dir_all(&path).await.map_err(|e| {
            ChainError::new(ErrorKind::Io, format!("mkdir {}: {}", self.0.display(), e))
        })
    }
}

// ──────────────────────────────────────────────────────────
// rm — remove a file or directory tree
// ──────────────────────────────────────────────────────────

pub(crate) struct RmStep(pub PathBuf);

#[async_trait]
impl Step for RmStep {
    fn name(&self) -> &str {
        "rm"
    }

    fn describe(&self) -> String {
        format!("rm {}", self.0.display())
    }

    async fn run(&self, ctx: &mut RunnerContext) -> Result<(), ChainError> {
        let path = ctx.resolve(&self.0);
        let meta = match tokio::fs::symlink_metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(ChainError::new(ErrorKind::Io, format!("rm {}: {}", self.0.display(), e)))
            }
        };
        let removed = if meta.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        removed.map_err(|e| ChainError::new(ErrorKind::Io, format!("rm {}: {}", self.0.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Settings;

    #[tokio::test]
    async fn test_mkdir_then_rm() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = RunnerContext::new(dir.path().to_path_buf(), Settings::default());

        MkdirStep("a/b/c".into()).run(&mut ctx).await.unwrap();
        assert!(dir.path().join("a/b/c").is_dir());
        std::fs::write(dir.path().join("a/file.txt"), "x").unwrap();

        RmStep("a/file.txt".into()).run(&mut ctx).await.unwrap();
        assert!(!dir.path().join("a/file.txt").exists());
        RmStep("a".into()).run(&mut ctx).await.unwrap();
        assert!(!dir.path().join("a").exists());
        // already gone
        RmStep("a".into()).run(&mut ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_cwd_and_env() {
        let mut ctx = RunnerContext::new(PathBuf::from("/work"), Settings::default());
        CwdStep("pkg/../app".into()).run(&mut ctx).await.unwrap();
        assert_eq!(ctx.cwd, PathBuf::from("/work/app"));
        CwdStep("/srv".into()).run(&mut ctx).await.unwrap();
        assert_eq!(ctx.cwd, PathBuf::from("/srv"));

        EnvStep("NO_COLOR".into(), "1".into()).run(&mut ctx).await.unwrap();
        assert_eq!(ctx.env.get("NO_COLOR").map(String::as_str), Some("1"));
    }

    #[tokio::test]
    async fn test_tmpdir_is_owned_by_context() {
        let mut ctx = RunnerContext::new(PathBuf::from("/work"), Settings::default());
        TmpdirStep.run(&mut ctx).await.unwrap();
        let path = ctx.cwd.clone();
        assert!(path.is_dir());
        assert_eq!(ctx.workdir.as_ref().map(|d| d.path().to_path_buf()), Some(path.clone()));
        drop(ctx);
        assert!(!path.exists());
    }
}
