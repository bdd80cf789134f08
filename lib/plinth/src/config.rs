//! TOML configuration loading for daemon config files.

use serde::de::DeserializeOwned;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("cannot parse config {path}: {source}")]
    Parse {
        path: String,
        source: serdeconv::Error,
    },
}

/// Load a TOML config file into a deserializable config struct.
pub fn load_toml<T, P>(path: P) -> Result<T, ConfigError>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;

    serdeconv::from_toml_str(&text).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::io::Write;

    #[derive(Deserialize, Debug)]
    struct Sample {
        name: String,
        count: u32,
    }

    fn scratch_file(name: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("plinth-{}-{}", std::process::id(), name));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_load_toml() {
        let path = scratch_file("config-ok.toml", "name = \"svc\"\ncount = 3\n");
        let sample: Sample = load_toml(&path).unwrap();
        assert_eq!(sample.name, "svc");
        assert_eq!(sample.count, 3);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_load_toml_missing_file() {
        let err = load_toml::<Sample, _>("/nonexistent/plinth.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_load_toml_bad_syntax() {
        let path = scratch_file("config-bad.toml", "name = \n");
        let err = load_toml::<Sample, _>(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        std::fs::remove_file(path).unwrap();
    }
}
