//! Instance configuration.

use crate::error::{ErrKind, Error};

/// Configuration for a language instance.
///
/// Passed to [`crate::State::new`]; validated there.  All fields have
/// workable defaults.
#[derive(Clone, Debug)]
pub struct Config {
    /// Compile debug info (file/function symbols and line tables).
    /// Stack traces carry line numbers only when this is on.
    pub debug: bool,

    /// Growth applied to the collection threshold after each cycle:
    /// `mem_limit = mem_used * (1.0 + mem_limit_growth)`.
    /// Must be in `(0.0, 2.0]`.
    pub mem_limit_growth: f64,

    /// Initial collection threshold in bytes.
    pub mem_limit_init: usize,

    /// Collect at every safepoint.  Slow; for shaking out missing
    /// roots in tests.
    pub gc_stress: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debug: true,
            mem_limit_growth: 0.5,
            mem_limit_init: 1 << 20,
            gc_stress: false,
        }
    }
}

impl Config {
    /// Check the configuration for nonsense values.
    pub fn validate(&self) -> Result<(), Error> {
        if !(self.mem_limit_growth > 0.0 && self.mem_limit_growth <= 2.0) {
            return Err(Error::simple(
                ErrKind::User,
                format!(
                    "mem_limit_growth must be in (0.0, 2.0], got {}",
                    self.mem_limit_growth
                ),
            ));
        }
        if self.mem_limit_init == 0 {
            return Err(Error::simple(
                ErrKind::User,
                "mem_limit_init must be nonzero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_bad_growth() {
        let mut c = Config::default();
        c.mem_limit_growth = 0.0;
        assert!(c.validate().is_err());
        c.mem_limit_growth = 2.5;
        assert!(c.validate().is_err());
        c.mem_limit_growth = 2.0;
        assert!(c.validate().is_ok());
    }

    #[test]
    fn rejects_zero_limit() {
        let mut c = Config::default();
        c.mem_limit_init = 0;
        assert!(c.validate().is_err());
    }
}
