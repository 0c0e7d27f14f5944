//! Size phase: measures the linked firmware against the board's limits.
//!
//! `recipe.size.pattern` is run and its stdout scanned with the
//! `recipe.size.regex*` expressions. Boards without `upload.maximum_size`
//! are not checked, and a size tool that fails or prints nothing usable only
//! produces a warning. Exceeding a limit is fatal.

use crate::build::compiler::apply_warning_level;
use crate::build::recipe::{ExecContext, OutputMode, exec_recipe};
use crate::error::BuildError;
use crate::keys;
use crate::logging;
use crate::properties::PropertyStore;
use anyhow::Result;
use regex::Regex;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SectionSize {
    pub name: String,
    pub size: u64,
    pub max_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SizeReport {
    Checked(Vec<SectionSize>),
    /// Why no size could be checked.
    Skipped(String),
}

impl SizeReport {
    pub fn sections(&self) -> &[SectionSize] {
        match self {
            SizeReport::Checked(sections) => sections,
            SizeReport::Skipped(_) => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MeasuredSize {
    text: u64,
    data: Option<u64>,
    eeprom: Option<u64>,
}

pub fn check_size(
    props: &PropertyStore,
    warnings: &str,
    ctx: &ExecContext,
) -> Result<SizeReport> {
    let mut props = props.clone();
    apply_warning_level(&mut props, warnings);

    let max_text = match props.get(keys::UPLOAD_MAXIMUM_SIZE).filter(|v| !v.is_empty()) {
        Some(v) => parse_limit(keys::UPLOAD_MAXIMUM_SIZE, v)?,
        None => {
            tracing::debug!("no upload.maximum_size, size check skipped");
            return Ok(SizeReport::Skipped(format!(
                "{} not set",
                keys::UPLOAD_MAXIMUM_SIZE
            )));
        }
    };
    let max_data = match props
        .get(keys::UPLOAD_MAXIMUM_DATA_SIZE)
        .filter(|v| !v.is_empty())
    {
        Some(v) => Some(parse_limit(keys::UPLOAD_MAXIMUM_DATA_SIZE, v)?),
        None => None,
    };

    let measured = match exec_size_recipe(&props, ctx) {
        Ok(measured) => measured,
        Err(e) if e.is_cancellation() => return Err(e.into()),
        Err(e) => {
            tracing::debug!("size recipe failed: {}", e);
            logging::warn("Couldn't determine program size");
            return Ok(SizeReport::Skipped(e.to_string()));
        }
    };
    tracing::debug!(
        text = measured.text,
        data = ?measured.data,
        eeprom = ?measured.eeprom,
        "measured"
    );

    println!(
        "Sketch uses {} bytes ({}%) of program storage space. Maximum is {} bytes.",
        measured.text,
        percent(measured.text, max_text),
        max_text
    );
    if let Some(data) = measured.data {
        match max_data.filter(|m| *m > 0) {
            Some(max) => println!(
                "Global variables use {} bytes ({}%) of dynamic memory, \
                 leaving {} bytes for local variables. Maximum is {} bytes.",
                data,
                percent(data, max),
                max.saturating_sub(data),
                max
            ),
            None => println!("Global variables use {} bytes of dynamic memory.", data),
        }
    }

    let mut sections = vec![SectionSize {
        name: "text".to_string(),
        size: measured.text,
        max_size: max_text,
    }];
    let data_limit = max_data.filter(|m| *m > 0);
    if let (Some(max), Some(data)) = (data_limit, measured.data) {
        sections.push(SectionSize {
            name: "data".to_string(),
            size: data,
            max_size: max,
        });
    }

    if measured.text > max_text {
        logging::warn("Sketch too big; see the platform documentation for tips on reducing it.");
        return Err(BuildError::SizeExceeded {
            section: "text",
            size: measured.text,
            max: max_text,
        }
        .into());
    }
    if let (Some(max), Some(data)) = (data_limit, measured.data)
        && data > max
    {
        logging::warn(
            "Not enough memory; see the platform documentation for tips on reducing your footprint.",
        );
        return Err(BuildError::SizeExceeded {
            section: "data",
            size: data,
            max,
        }
        .into());
    }

    if let Some(w) = props
        .get(keys::BUILD_WARN_DATA_PERCENTAGE)
        .filter(|v| !v.is_empty())
    {
        let warn_percentage = parse_limit(keys::BUILD_WARN_DATA_PERCENTAGE, w)?;
        if let (Some(max), Some(data)) = (data_limit, measured.data)
            && is_low_memory(data, max, warn_percentage)
        {
            logging::warn("Low memory available, stability problems may occur.");
        }
    }

    Ok(SizeReport::Checked(sections))
}

fn parse_limit(key: &str, value: &str) -> Result<u64, BuildError> {
    value.trim().parse().map_err(|_| BuildError::InvalidSizeConfig {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn percent(size: u64, max: u64) -> u64 {
    size.saturating_mul(100).checked_div(max).unwrap_or(0)
}

fn is_low_memory(data: u64, max: u64, warn_percentage: u64) -> bool {
    data > max.saturating_mul(warn_percentage) / 100
}

fn exec_size_recipe(
    props: &PropertyStore,
    ctx: &ExecContext,
) -> Result<MeasuredSize, BuildError> {
    let text_re = props.get(keys::RECIPE_SIZE_REGEX).unwrap_or_default();
    if text_re.is_empty() {
        return Err(BuildError::PatternMissing {
            recipe: keys::RECIPE_SIZE_REGEX.to_string(),
        });
    }

    let out = exec_recipe(
        props,
        keys::RECIPE_SIZE_PATTERN,
        false,
        OutputMode::Capture,
        OutputMode::Show,
        ctx,
    )?;
    let output = String::from_utf8_lossy(&out.stdout);

    let text = compute_size(keys::RECIPE_SIZE_REGEX, text_re, &output)?.unwrap_or(0);
    let data = compute_size(
        keys::RECIPE_SIZE_REGEX_DATA,
        props.get(keys::RECIPE_SIZE_REGEX_DATA).unwrap_or_default(),
        &output,
    )?;
    let eeprom = compute_size(
        keys::RECIPE_SIZE_REGEX_EEPROM,
        props.get(keys::RECIPE_SIZE_REGEX_EEPROM).unwrap_or_default(),
        &output,
    )?;
    Ok(MeasuredSize { text, data, eeprom })
}

/// Sums every numeric group, the whole match included, of every match of
/// `re` in `output`. `None` when `re` is empty.
pub fn compute_size(key: &str, re: &str, output: &str) -> Result<Option<u64>, BuildError> {
    if re.is_empty() {
        return Ok(None);
    }
    let re = Regex::new(&format!("(?m){}", re)).map_err(|source| {
        BuildError::InvalidRegex {
            key: key.to_string(),
            source,
        }
    })?;

    let size = re
        .captures_iter(output)
        .flat_map(|caps| {
            caps.iter()
                .flatten()
                .filter_map(|m| m.as_str().parse::<u64>().ok())
                .collect::<Vec<_>>()
        })
        .fold(0u64, u64::saturating_add);
    Ok(Some(size))
}
