use std::{fs, path::Path, time::Duration};

use super::{
    error::{ConfigError, ConfigResult},
    model::{Config, DEFAULT_LISTEN_ADDRESS},
    raw::{RawConfig, RawEmulator, RawPortRange, RawRule},
};
use crate::broker::{EmulatorSpec, RuleSpec, ports::PortRange};
use crate::state::CommandLine;

pub fn load_from_path<P: AsRef<Path>>(path: P) -> ConfigResult<Config> {
    let path_ref = path.as_ref();
    let raw_contents = fs::read_to_string(path_ref).map_err(|source| ConfigError::ReadFailure {
        path: path_ref.to_path_buf(),
        source,
    })?;
    load_from_str(&raw_contents)
}

pub fn load_from_str(contents: &str) -> ConfigResult<Config> {
    let raw: RawConfig = toml::from_str(contents)?;
    convert_raw_config(raw)
}

fn convert_raw_config(raw: RawConfig) -> ConfigResult<Config> {
    let listen_address = raw
        .listen_address
        .unwrap_or_else(|| DEFAULT_LISTEN_ADDRESS.to_string());

    let default_emulator_start_deadline = raw
        .default_emulator_start_deadline_seconds
        .map(Duration::from_secs);

    let port_ranges = raw
        .port_ranges
        .into_iter()
        .map(convert_port_range)
        .collect::<ConfigResult<Vec<_>>>()?;
    ensure_disjoint_ranges(&port_ranges)?;

    let emulators = raw
        .emulators
        .into_iter()
        .map(convert_emulator)
        .collect::<ConfigResult<Vec<_>>>()?;

    let rules = raw
        .rules
        .into_iter()
        .map(convert_rule)
        .collect::<ConfigResult<Vec<_>>>()?;

    Ok(Config {
        listen_address,
        default_emulator_start_deadline,
        port_ranges,
        emulators,
        rules,
    })
}

fn convert_port_range(raw: RawPortRange) -> ConfigResult<PortRange> {
    let begin = raw.begin.ok_or_else(|| ConfigError::MissingField {
        section: "port_range".to_string(),
        field: "begin",
    })?;
    let end = raw.end.ok_or_else(|| ConfigError::MissingField {
        section: "port_range".to_string(),
        field: "end",
    })?;
    if begin >= end {
        return Err(ConfigError::InvalidPortRange { begin, end });
    }
    Ok(PortRange { begin, end })
}

fn ensure_disjoint_ranges(ranges: &[PortRange]) -> ConfigResult<()> {
    let mut sorted = ranges.to_vec();
    sorted.sort_by_key(|range| range.begin);
    for pair in sorted.windows(2) {
        if pair[1].begin < pair[0].end {
            return Err(ConfigError::OverlappingPortRanges {
                first: pair[0],
                second: pair[1],
            });
        }
    }
    Ok(())
}

fn convert_emulator(raw: RawEmulator) -> ConfigResult<EmulatorSpec> {
    let emulator_id = raw.emulator_id.ok_or_else(|| ConfigError::MissingField {
        section: "emulator".to_string(),
        field: "emulator_id",
    })?;
    let path = raw.path.ok_or_else(|| ConfigError::MissingField {
        section: format!("emulator '{emulator_id}'"),
        field: "path",
    })?;
    let rule_id = raw
        .rule_id
        .unwrap_or_else(|| format!("{emulator_id}_rule"));

    Ok(EmulatorSpec {
        emulator_id,
        rule: RuleSpec {
            rule_id,
            target_patterns: raw.target_patterns,
            resolved_host: raw.resolved_host.unwrap_or_default(),
            requires_secure_connection: raw.requires_secure_connection,
        },
        start_command: CommandLine {
            path,
            args: raw.args,
        },
        start_on_demand: raw.start_on_demand,
    })
}

fn convert_rule(raw: RawRule) -> ConfigResult<RuleSpec> {
    let rule_id = raw.rule_id.ok_or_else(|| ConfigError::MissingField {
        section: "rule".to_string(),
        field: "rule_id",
    })?;
    Ok(RuleSpec {
        rule_id,
        target_patterns: raw.target_patterns,
        resolved_host: raw.resolved_host.unwrap_or_default(),
        requires_secure_connection: raw.requires_secure_connection,
    })
}
