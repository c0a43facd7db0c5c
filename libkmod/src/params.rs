use std::fs;
use std::io;
use std::path::Path;

use tracing::info;

use crate::catalog::{DRIVER_MODULES, same_module};
use crate::error::KmodError;

pub const DEFAULT_CONFIG_DIR: &str = "/drivers";

/// Parameters handed to `modprobe`, per module.
///
/// Each module reads `<config dir>/<module>.conf`, one token per line. A
/// missing file means no parameters. Tokens are passed through untouched; the
/// kernel rejects anything it does not understand.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleParams {
    entries: Vec<(String, Vec<String>)>,
}

impl ModuleParams {
    /// Read the parameter files of every driver module.
    pub fn load(config_dir: &Path) -> Result<Self, KmodError> {
        let modules: Vec<&str> = DRIVER_MODULES.iter().map(|(name, _)| *name).collect();
        Self::load_modules(config_dir, &modules)
    }

    pub fn load_modules(config_dir: &Path, modules: &[&str]) -> Result<Self, KmodError> {
        let mut entries = Vec::with_capacity(modules.len());
        for module in modules {
            let path = config_dir.join(format!("{module}.conf"));
            let tokens = match fs::read_to_string(&path) {
                Ok(content) => parse_tokens(&content),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
                Err(e) => return Err(KmodError::io(path, e)),
            };
            info!("Module parameters provided for {module}: {tokens:?}");
            entries.push((module.to_string(), tokens));
        }
        Ok(ModuleParams { entries })
    }

    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, Vec<String>)>,
        S: Into<String>,
    {
        ModuleParams {
            entries: entries
                .into_iter()
                .map(|(module, tokens)| (module.into(), tokens))
                .collect(),
        }
    }

    /// Parameters for `module`; empty when none were configured.
    pub fn get(&self, module: &str) -> &[String] {
        self.entries
            .iter()
            .find(|(name, _)| same_module(name, module))
            .map(|(_, tokens)| tokens.as_slice())
            .unwrap_or(&[])
    }
}

fn parse_tokens(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
