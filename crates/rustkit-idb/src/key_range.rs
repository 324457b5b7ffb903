//! Key ranges.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::error::{IDBError, Result};
use crate::key::{compare, Key};

/// An interval over keys. A missing bound is unbounded on that side.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct KeyRange {
    pub lower: Option<Key>,
    pub upper: Option<Key>,
    pub lower_open: bool,
    pub upper_open: bool,
}

impl KeyRange {
    /// Range containing every key.
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Range containing exactly `key`.
    pub fn only(key: impl Into<Key>) -> Result<Self> {
        let key = key.into();
        key.validate()?;
        Ok(Self {
            lower: Some(key.clone()),
            upper: Some(key),
            lower_open: false,
            upper_open: false,
        })
    }

    /// Keys above `key` (excluding it when `open`).
    pub fn lower_bound(key: impl Into<Key>, open: bool) -> Result<Self> {
        let key = key.into();
        key.validate()?;
        Ok(Self {
            lower: Some(key),
            lower_open: open,
            ..Self::default()
        })
    }

    /// Keys below `key` (excluding it when `open`).
    pub fn upper_bound(key: impl Into<Key>, open: bool) -> Result<Self> {
        let key = key.into();
        key.validate()?;
        Ok(Self {
            upper: Some(key),
            upper_open: open,
            ..Self::default()
        })
    }

    /// Keys between `lower` and `upper`.
    pub fn bound(
        lower: impl Into<Key>,
        upper: impl Into<Key>,
        lower_open: bool,
        upper_open: bool,
    ) -> Result<Self> {
        let lower = lower.into();
        let upper = upper.into();
        lower.validate()?;
        upper.validate()?;

        match compare(&lower, &upper) {
            Ordering::Greater => {
                return Err(IDBError::data(format!(
                    "Lower bound {} is greater than upper bound {}",
                    lower, upper
                )))
            }
            Ordering::Equal if lower_open || upper_open => {
                return Err(IDBError::data(
                    "Equal bounds require both ends to be closed",
                ))
            }
            _ => {}
        }

        Ok(Self {
            lower: Some(lower),
            upper: Some(upper),
            lower_open,
            upper_open,
        })
    }

    /// Validate both bounds. Ranges built from a bare [`Key`] skip the
    /// factory checks, so requests call this on entry.
    pub fn validate(&self) -> Result<()> {
        if let Some(lower) = &self.lower {
            lower.validate()?;
        }
        if let Some(upper) = &self.upper {
            upper.validate()?;
        }
        if let (Some(lower), Some(upper)) = (&self.lower, &self.upper) {
            let order = compare(lower, upper);
            if order == Ordering::Greater
                || (order == Ordering::Equal && (self.lower_open || self.upper_open))
            {
                return Err(IDBError::data("Key range is empty"));
            }
        }
        Ok(())
    }

    /// Whether both bounds are absent.
    pub fn is_unbounded(&self) -> bool {
        self.lower.is_none() && self.upper.is_none()
    }

    /// The single key this range matches, if it is an `only` range.
    pub fn as_only(&self) -> Option<&Key> {
        match (&self.lower, &self.upper) {
            (Some(lower), Some(upper))
                if !self.lower_open && !self.upper_open && lower == upper =>
            {
                Some(lower)
            }
            _ => None,
        }
    }

    /// Whether `key` is below the range.
    pub fn is_below(&self, key: &Key) -> bool {
        match &self.lower {
            Some(lower) => match compare(key, lower) {
                Ordering::Less => true,
                Ordering::Equal => self.lower_open,
                Ordering::Greater => false,
            },
            None => false,
        }
    }

    /// Whether `key` is above the range.
    pub fn is_above(&self, key: &Key) -> bool {
        match &self.upper {
            Some(upper) => match compare(key, upper) {
                Ordering::Greater => true,
                Ordering::Equal => self.upper_open,
                Ordering::Less => false,
            },
            None => false,
        }
    }

    /// Whether `key` lies inside the range.
    pub fn includes(&self, key: &Key) -> bool {
        !self.is_below(key) && !self.is_above(key)
    }

    /// Raise the lower bound to `key` if that narrows the range.
    pub(crate) fn tighten_lower(&mut self, key: &Key, open: bool) {
        let replace = match &self.lower {
            None => true,
            Some(lower) => match compare(key, lower) {
                Ordering::Greater => true,
                Ordering::Equal => open && !self.lower_open,
                Ordering::Less => false,
            },
        };
        if replace {
            self.lower = Some(key.clone());
            self.lower_open = open;
        }
    }

    /// Lower the upper bound to `key` if that narrows the range.
    pub(crate) fn tighten_upper(&mut self, key: &Key, open: bool) {
        let replace = match &self.upper {
            None => true,
            Some(upper) => match compare(key, upper) {
                Ordering::Less => true,
                Ordering::Equal => open && !self.upper_open,
                Ordering::Greater => false,
            },
        };
        if replace {
            self.upper = Some(key.clone());
            self.upper_open = open;
        }
    }
}

impl From<Key> for KeyRange {
    fn from(key: Key) -> Self {
        Self {
            lower: Some(key.clone()),
            upper: Some(key),
            lower_open: false,
            upper_open: false,
        }
    }
}
