//! Pricing tables — one document per provider, mapping model name to
//! USD-per-million-token input/output rates, with a versioned-prefix
//! fallback so a dated model id (`gpt-4o-2024-08-06`) resolves against a
//! base entry (`gpt-4o`) when no exact row is loaded.

use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::Result;

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ModelRate {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    by_provider: HashMap<String, HashMap<String, ModelRate>>,
}

impl PricingTable {
    /// Load one `<provider>.yaml` document per file under `dir`. Missing
    /// directory yields an empty table rather than an error — pricing is
    /// advisory, not load-bearing for dispatch.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut by_provider = HashMap::new();
        if !dir.is_dir() {
            return Ok(Self { by_provider });
        }

        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }
            let contents = fs::read_to_string(&path)?;
            let rates: HashMap<String, ModelRate> = serde_yaml::from_str(&contents)?;
            by_provider.insert(stem.to_string(), rates);
        }

        Ok(Self { by_provider })
    }

    /// USD cost for a completed call, or `None` if the provider/model has
    /// no pricing entry even after prefix fallback.
    pub fn cost(&self, provider: &str, model: &str, input_tokens: u64, output_tokens: u64) -> Option<f64> {
        let rates = self.by_provider.get(provider)?;
        let rate = rates.get(model).copied().or_else(|| Self::prefix_match(rates, model))?;
        Some(
            (input_tokens as f64 / 1_000_000.0) * rate.input_per_million
                + (output_tokens as f64 / 1_000_000.0) * rate.output_per_million,
        )
    }

    /// Longest registered key that is a prefix of `model`, e.g. `gpt-4o`
    /// matching `gpt-4o-2024-08-06`.
    fn prefix_match(rates: &HashMap<String, ModelRate>, model: &str) -> Option<ModelRate> {
        rates
            .iter()
            .filter(|(key, _)| model.starts_with(key.as_str()))
            .max_by_key(|(key, _)| key.len())
            .map(|(_, rate)| *rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_pricing_file(dir: &Path, provider: &str, contents: &str) {
        let path = dir.join(format!("{provider}.yaml"));
        let mut f = fs::File::create(path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    #[test]
    fn missing_directory_yields_empty_table() {
        let table = PricingTable::load_dir(Path::new("/nonexistent/pricing/dir")).unwrap();
        assert_eq!(table.cost("openai", "gpt-4o", 1000, 1000), None);
    }

    #[test]
    fn exact_model_match() {
        let dir = tempfile::tempdir().unwrap();
        write_pricing_file(
            dir.path(),
            "openai",
            "gpt-4o-mini:\n  input_per_million: 0.15\n  output_per_million: 0.6\n",
        );
        let table = PricingTable::load_dir(dir.path()).unwrap();
        let cost = table.cost("openai", "gpt-4o-mini", 1_000_000, 1_000_000).unwrap();
        assert!((cost - 0.75).abs() < 1e-9);
    }

    #[test]
    fn versioned_model_falls_back_to_prefix() {
        let dir = tempfile::tempdir().unwrap();
        write_pricing_file(
            dir.path(),
            "openai",
            "gpt-4o:\n  input_per_million: 2.5\n  output_per_million: 10.0\n",
        );
        let table = PricingTable::load_dir(dir.path()).unwrap();
        let cost = table.cost("openai", "gpt-4o-2024-08-06", 1_000_000, 0).unwrap();
        assert!((cost - 2.5).abs() < 1e-9);
    }

    #[test]
    fn unknown_provider_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        write_pricing_file(dir.path(), "openai", "gpt-4o:\n  input_per_million: 2.5\n  output_per_million: 10.0\n");
        let table = PricingTable::load_dir(dir.path()).unwrap();
        assert!(table.cost("anthropic", "claude-sonnet-4", 100, 100).is_none());
    }
}
