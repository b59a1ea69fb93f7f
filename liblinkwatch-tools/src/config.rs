use serde::de::DeserializeOwned;
use std::io;

use crate::error::Error;

/// Configuration tree, loaded from a TOML document.
///
/// Keys are addressed with dotted paths (`"live.ring_pages"`), each component
/// selecting a table entry.
#[derive(Clone, Debug)]
pub struct Config {
    value: toml::Value,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            value: toml::Value::Table(toml::map::Map::new()),
        }
    }
}

impl Config {
    fn lookup(&self, k: &str) -> Option<&toml::Value> {
        let mut item = &self.value;
        for key in k.split('.') {
            item = item.get(key)?;
        }
        Some(item)
    }

    /// Get an entry by path. If the input argument contains dots, the path is split
    /// into keys, each key being requested recursively.
    pub fn get<T: AsRef<str>>(&self, k: T) -> Option<&str> {
        self.lookup(k.as_ref())?.as_str()
    }

    /// Get an entry of type integer by path
    pub fn get_usize<T: AsRef<str>>(&self, k: T) -> Option<usize> {
        self.lookup(k.as_ref())?
            .as_integer()
            .and_then(|i| if i >= 0 { Some(i as usize) } else { None })
    }

    /// Get an entry of type boolean by path
    pub fn get_bool<T: AsRef<str>>(&self, k: T) -> Option<bool> {
        self.lookup(k.as_ref())?.as_bool()
    }

    /// Deserialize a whole table (for ex. `[live]`) into a typed structure
    pub fn get_section<D: DeserializeOwned, T: AsRef<str>>(&self, k: T) -> Result<Option<D>, Error> {
        match self.lookup(k.as_ref()) {
            None => Ok(None),
            Some(v) => v
                .clone()
                .try_into()
                .map(Some)
                .map_err(|e| Error::Config(format!("section {}: {}", k.as_ref(), e))),
        }
    }

    /// Set an entry by path, creating intermediate tables as needed.
    ///
    /// Existing values are overwritten, including non-table values on the path.
    pub fn set<T: AsRef<str>, V: Into<toml::Value>>(&mut self, k: T, v: V) {
        let keys: Vec<&str> = k.as_ref().split('.').collect();
        let (last, parents) = match keys.split_last() {
            Some(x) => x,
            None => return,
        };
        let mut item = &mut self.value;
        for key in parents {
            if !item.is_table() {
                *item = toml::Value::Table(toml::map::Map::new());
            }
            let table = match item.as_table_mut() {
                Some(t) => t,
                None => return,
            };
            item = table
                .entry(key.to_string())
                .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
        }
        if !item.is_table() {
            *item = toml::Value::Table(toml::map::Map::new());
        }
        if let Some(table) = item.as_table_mut() {
            table.insert(last.to_string(), v.into());
        }
    }

    /// Load configuration from input object. If keys are already present, they are overwritten
    pub fn load_config<R: io::Read>(&mut self, mut config: R) -> Result<(), Error> {
        let mut s = String::new();
        config.read_to_string(&mut s)?;
        match s.parse::<toml::Table>() {
            Ok(table) => {
                self.value = toml::Value::Table(table);
                Ok(())
            }
            Err(e) => Err(Error::Config(format!("Load configuration failed: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Config;
    use serde::Deserialize;

    #[test]
    fn config_dotted_paths() {
        let mut config = Config::default();
        config
            .load_config("log_file = \"x.log\"\n[live]\nring_pages = 64\npromisc = true\n".as_bytes())
            .unwrap();
        assert_eq!(config.get("log_file"), Some("x.log"));
        assert_eq!(config.get_usize("live.ring_pages"), Some(64));
        assert_eq!(config.get_bool("live.promisc"), Some(true));
        assert_eq!(config.get("live.missing"), None);
    }

    #[test]
    fn config_set_overrides() {
        let mut config = Config::default();
        config.set("neighbors.capacity", 12);
        config.set("output_dir", "/tmp");
        assert_eq!(config.get_usize("neighbors.capacity"), Some(12));
        assert_eq!(config.get("output_dir"), Some("/tmp"));
        config.set("neighbors.capacity", 3);
        assert_eq!(config.get_usize("neighbors.capacity"), Some(3));
    }

    #[test]
    fn config_section() {
        #[derive(Deserialize)]
        struct Live {
            ring_pages: usize,
        }
        let mut config = Config::default();
        config.load_config("[live]\nring_pages = 8\n".as_bytes()).unwrap();
        let live: Live = config.get_section("live").unwrap().unwrap();
        assert_eq!(live.ring_pages, 8);
        assert!(config.get_section::<Live, _>("other").unwrap().is_none());
    }

    #[test]
    fn config_invalid_document() {
        let mut config = Config::default();
        assert!(config.load_config("this is = = not toml".as_bytes()).is_err());
    }
}
