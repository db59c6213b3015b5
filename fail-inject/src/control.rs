//! Text control surface (`fail_loc=0x80000e01` style)

use crate::injector::FailInjector;
use crate::loc::VAL_ANY;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FailError {
    #[error("unknown parameter: {0}")]
    UnknownParam(String),

    #[error("invalid value for {param}: {value}")]
    InvalidValue { param: String, value: String },
}

/// Readable snapshot of the fault-injection parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailParams {
    pub fail_loc: u64,
    pub fail_val: u32,
    pub fail_err: i32,
}

fn parse_u64(text: &str) -> Option<u64> {
    let text = text.trim();
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

fn parse_i64(text: &str) -> Option<i64> {
    let text = text.trim();
    match text.strip_prefix('-') {
        Some(rest) => parse_u64(rest).and_then(|v| i64::try_from(v).ok()).map(|v| -v),
        None => parse_u64(text).and_then(|v| i64::try_from(v).ok()),
    }
}

impl FailInjector {
    /// Set `fail_loc`, `fail_val` or `fail_err` from text. Numbers may be
    /// hex (`0x…`) or decimal; `fail_val=-1` is the match-any wildcard.
    pub fn set_param(&self, name: &str, value: &str) -> Result<(), FailError> {
        let invalid = || FailError::InvalidValue {
            param: name.to_string(),
            value: value.to_string(),
        };
        match name {
            "fail_loc" => self.set_loc(parse_u64(value).ok_or_else(invalid)?),
            "fail_val" => {
                let val = match parse_i64(value).ok_or_else(invalid)? {
                    -1 => VAL_ANY,
                    v => u32::try_from(v).map_err(|_| invalid())?,
                };
                self.set_val(val);
            }
            "fail_err" => {
                let err = parse_i64(value)
                    .and_then(|v| i32::try_from(v).ok())
                    .ok_or_else(invalid)?;
                self.set_err(err);
            }
            _ => return Err(FailError::UnknownParam(name.to_string())),
        }
        Ok(())
    }

    pub fn get_param(&self, name: &str) -> Result<String, FailError> {
        match name {
            "fail_loc" => Ok(self.loc().to_string()),
            "fail_val" => Ok(match self.val() {
                VAL_ANY => "-1".to_string(),
                v => v.to_string(),
            }),
            "fail_err" => Ok(self.err().to_string()),
            _ => Err(FailError::UnknownParam(name.to_string())),
        }
    }

    pub fn params(&self) -> FailParams {
        FailParams {
            fail_loc: self.loc().0,
            fail_val: self.val(),
            fail_err: self.err(),
        }
    }

    /// Apply a full snapshot; `fail_loc` is written last so the new value
    /// and error are in place before the failpoint arms.
    pub fn apply(&self, params: &FailParams) {
        self.set_val(params.fail_val);
        self.set_err(params.fail_err);
        self.set_loc(params.fail_loc);
    }
}
