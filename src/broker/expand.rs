//! Start-time substitution of `{port:NAME}`, `{env:NAME}` and `{dir:broker}`
//! tokens in an emulator's command line.

use std::{collections::HashMap, path::Path};

use once_cell::sync::Lazy;
use regex::Regex;

use super::{
    error::BrokerResult,
    ports::PortPicker,
};
use crate::state::CommandLine;

static TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{(port|env|dir):([A-Za-z0-9.\-]+)\}").expect("valid token regex")
});

/// The rewritten command line plus the `NAME -> port` leases taken for it.
#[derive(Debug, Clone)]
pub struct Expansion {
    pub command: CommandLine,
    pub ports: HashMap<String, u16>,
}

/// Expand every token in `command`. Port names are scoped to this one
/// expansion: the same NAME maps to one leased port, distinct NAMEs to
/// distinct ports. On failure all ports leased so far are released.
pub fn expand_command(
    command: &CommandLine,
    broker_dir: &Path,
    picker: &PortPicker,
) -> BrokerResult<Expansion> {
    let mut ports = HashMap::new();
    let result = (|| {
        let path = expand_tokens(&command.path, broker_dir, picker, &mut ports)?;
        let args = command
            .args
            .iter()
            .map(|arg| expand_tokens(arg, broker_dir, picker, &mut ports))
            .collect::<BrokerResult<Vec<_>>>()?;
        Ok(CommandLine { path, args })
    })();

    match result {
        Ok(command) => Ok(Expansion { command, ports }),
        Err(error) => {
            picker.release_all(ports.into_values());
            Err(error)
        }
    }
}

fn expand_tokens(
    input: &str,
    broker_dir: &Path,
    picker: &PortPicker,
    ports: &mut HashMap<String, u16>,
) -> BrokerResult<String> {
    let mut rendered = String::with_capacity(input.len());
    let mut last = 0usize;
    for captures in TOKEN.captures_iter(input) {
        let m = captures.get(0).expect("match present");
        rendered.push_str(&input[last..m.start()]);
        let kind = captures.get(1).expect("kind group").as_str();
        let name = captures.get(2).expect("name group").as_str();
        match kind {
            "port" => {
                let port = match ports.get(name) {
                    Some(port) => *port,
                    None => {
                        let port = picker.next()?;
                        ports.insert(name.to_string(), port);
                        port
                    }
                };
                rendered.push_str(&port.to_string());
            }
            "env" => rendered.push_str(&std::env::var(name).unwrap_or_default()),
            "dir" if name == "broker" => rendered.push_str(&broker_dir.display().to_string()),
            // Unknown directory names stay literal.
            _ => rendered.push_str(m.as_str()),
        }
        last = m.end();
    }
    rendered.push_str(&input[last..]);
    Ok(rendered)
}
