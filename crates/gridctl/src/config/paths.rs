use etcetera::{choose_app_strategy, AppStrategy, AppStrategyArgs};
use std::path::PathBuf;

/// Resolves `~/.gridctl/{state,logs,cache}` the way the teacher resolves its own
/// config directory, with a `GRIDCTL_PATH_ROOT` override for tests so the daemon
/// lifecycle tests never touch a real home directory.
pub struct Paths;

impl Paths {
    fn base(dir_type: DirType) -> PathBuf {
        if let Ok(root) = std::env::var("GRIDCTL_PATH_ROOT") {
            let base = PathBuf::from(root);
            return match dir_type {
                DirType::State => base.join("state"),
                DirType::Logs => base.join("logs"),
                DirType::Cache => base.join("cache"),
            };
        }

        let strategy = choose_app_strategy(AppStrategyArgs {
            top_level_domain: "dev".to_string(),
            author: "gridctl".to_string(),
            app_name: "gridctl".to_string(),
        })
        .expect("gridctl requires a resolvable home directory");

        let home = strategy.data_dir();
        match dir_type {
            DirType::State => home.join("state"),
            DirType::Logs => home.join("logs"),
            DirType::Cache => home.join("cache"),
        }
    }

    pub fn state_dir() -> PathBuf {
        Self::base(DirType::State)
    }

    pub fn logs_dir() -> PathBuf {
        Self::base(DirType::Logs)
    }

    pub fn cache_dir() -> PathBuf {
        Self::base(DirType::Cache)
    }

    pub fn state_file(stack_name: &str) -> PathBuf {
        Self::state_dir().join(format!("{stack_name}.json"))
    }

    pub fn lock_file(stack_name: &str) -> PathBuf {
        Self::state_dir().join(format!("{stack_name}.lock"))
    }

    pub fn log_file(stack_name: &str) -> PathBuf {
        Self::logs_dir().join(format!("{stack_name}.log"))
    }

    /// Ensures all three base directories exist; called once at daemon startup.
    pub fn ensure_dirs() -> std::io::Result<()> {
        std::fs::create_dir_all(Self::state_dir())?;
        std::fs::create_dir_all(Self::logs_dir())?;
        std::fs::create_dir_all(Self::cache_dir())?;
        Ok(())
    }
}

enum DirType {
    State,
    Logs,
    Cache,
}
