use anyhow::Result;
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default)]
pub struct OutputOptions {
    pub pretty: bool,
}

pub fn to_json<T: Serialize>(value: &T, opts: &OutputOptions) -> Result<String> {
    let json = if opts.pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    Ok(json)
}

pub fn print_json<T: Serialize>(value: &T, opts: &OutputOptions) -> Result<()> {
    println!("{}", to_json(value, opts)?);
    Ok(())
}
