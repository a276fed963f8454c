//! price-mirror setup wizard.
//!
//! Interactive terminal wizard that writes `config.toml` to the project root.
//! Values from an existing config are offered as defaults, so re-running the
//! wizard only asks about what should change.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

// ── Raw TOML parse structs (loose, all fields optional so partial configs load) ──

#[derive(Deserialize, Default)]
struct RawConfig {
    telegram: Option<RawTelegram>,
    channels: Option<RawChannels>,
    pricing: Option<RawPricing>,
    scrub: Option<RawScrub>,
    storage: Option<RawStorage>,
}

#[derive(Deserialize, Default)]
struct RawTelegram {
    bot_token: Option<String>,
}

#[derive(Deserialize, Default)]
struct RawChannels {
    sources: Option<Vec<String>>,
    target: Option<String>,
}

#[derive(Deserialize, Default)]
struct RawPricing {
    pro_delta: Option<i64>,
    default_delta: Option<i64>,
}

#[derive(Deserialize, Default)]
struct RawScrub {
    contact_handle: Option<String>,
}

#[derive(Deserialize, Default)]
struct RawStorage {
    database_path: Option<String>,
}

/// Answers carried over from a previous config.toml.
#[derive(Debug, Default, PartialEq)]
struct Existing {
    bot_token: String,
    sources: String,
    target: String,
    pro_delta: Option<i64>,
    default_delta: Option<i64>,
    contact_handle: String,
    db_path: String,
}

fn parse_existing(content: &str) -> Existing {
    let raw: RawConfig = toml::from_str(content).unwrap_or_default();
    let telegram = raw.telegram.unwrap_or_default();
    let channels = raw.channels.unwrap_or_default();
    let pricing = raw.pricing.unwrap_or_default();
    Existing {
        bot_token: telegram.bot_token.unwrap_or_default(),
        sources: channels.sources.unwrap_or_default().join(", "),
        target: channels.target.unwrap_or_default(),
        pro_delta: pricing.pro_delta,
        default_delta: pricing.default_delta,
        contact_handle: raw.scrub.and_then(|s| s.contact_handle).unwrap_or_default(),
        db_path: raw.storage.and_then(|s| s.database_path).unwrap_or_default(),
    }
}

fn load_existing(path: &Path) -> Existing {
    match std::fs::read_to_string(path) {
        Ok(content) => parse_existing(&content),
        Err(_) => Existing::default(),
    }
}

// ── Config formatting ──────────────────────────────────────────────────────────

struct ConfigParams<'a> {
    bot_token: &'a str,
    sources: &'a str,
    target: &'a str,
    pro_delta: i64,
    default_delta: i64,
    contact_handle: &'a str,
    db_path: &'a str,
}

/// Quote a value as a TOML basic string.
fn quoted(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Produces a valid config.toml string. Extracted so it can be unit-tested.
fn format_config(p: &ConfigParams<'_>) -> String {
    let sources: Vec<String> = p
        .sources
        .split([',', ' '])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(quoted)
        .collect();
    let sources_str = sources.join(", ");

    let handle_line = if p.contact_handle.is_empty() {
        "# contact_handle = \"@your_manager\"".to_owned()
    } else {
        format!("contact_handle = {}", quoted(p.contact_handle))
    };

    let bot_token = quoted(p.bot_token);
    let target = quoted(p.target);
    let pro_delta = p.pro_delta;
    let default_delta = p.default_delta;
    let db_path = quoted(p.db_path);

    format!(
        r#"[telegram]
bot_token = {bot_token}

[channels]
sources = [{sources_str}]
target = {target}

[pricing]
pro_delta = {pro_delta}
default_delta = {default_delta}
zero_floor = true
ignore_below = 10000
premium_scope = "line"

[scrub]
{handle_line}

[storage]
database_path = {db_path}
download_dir = "downloads"

[admin]
enabled = false
bind = "127.0.0.1:8000"
username = "admin"
password = "changeme"
"#
    )
}

// ── CLI ────────────────────────────────────────────────────────────────────────

fn run_cli(project_root: &Path) -> Result<()> {
    use std::io::{self, Write};

    println!("=== price-mirror setup ===\n");

    let config_path = project_root.join("config.toml");
    let existing = load_existing(&config_path);

    let read_line = |prompt: &str| -> Result<String> {
        print!("{prompt}");
        io::stdout().flush()?;
        let mut buf = String::new();
        io::stdin().read_line(&mut buf)?;
        Ok(buf.trim().to_owned())
    };

    let or_default = |s: String, default: &str| {
        if s.is_empty() {
            default.to_owned()
        } else {
            s
        }
    };

    let with_hint = |label: &str, current: &str| {
        if current.is_empty() {
            format!("{label}: ")
        } else {
            format!("{label} [{current}]: ")
        }
    };

    let bot_token = or_default(
        read_line(&with_hint("Telegram bot token", &existing.bot_token))?,
        &existing.bot_token,
    );
    let sources = or_default(
        read_line(&with_hint(
            "Source channels (ids or @usernames, comma-separated)",
            &existing.sources,
        ))?,
        &existing.sources,
    );
    let target = or_default(
        read_line(&with_hint("Target channel", &existing.target))?,
        &existing.target,
    );

    let pro_default = existing.pro_delta.unwrap_or(2000).to_string();
    let pro_delta: i64 = or_default(read_line(&with_hint("Pro delta", &pro_default))?, &pro_default)
        .parse()
        .context("Pro delta must be a whole number")?;
    let default_default = existing.default_delta.unwrap_or(1000).to_string();
    let default_delta: i64 = or_default(
        read_line(&with_hint("Default delta", &default_default))?,
        &default_default,
    )
    .parse()
    .context("Default delta must be a whole number")?;

    let contact_handle = or_default(
        read_line(&with_hint("Contact handle (optional)", &existing.contact_handle))?,
        &existing.contact_handle,
    );
    let db_default = if existing.db_path.is_empty() {
        "mirror.db".to_string()
    } else {
        existing.db_path.clone()
    };
    let db_path = or_default(read_line(&with_hint("Database path", &db_default))?, &db_default);

    if sources.is_empty() || target.is_empty() {
        anyhow::bail!("At least one source channel and a target channel are required");
    }

    let config = format_config(&ConfigParams {
        bot_token: &bot_token,
        sources: &sources,
        target: &target,
        pro_delta,
        default_delta,
        contact_handle: &contact_handle,
        db_path: &db_path,
    });

    std::fs::write(&config_path, &config)
        .with_context(|| format!("Could not write {}", config_path.display()))?;

    println!("\n✓  config.toml saved to {}", config_path.display());
    if bot_token.is_empty() {
        println!("   No bot token stored; set BOT_TOKEN before starting.");
    }
    println!("   Run the mirror with:  cargo run");
    Ok(())
}

// ── Entry point ────────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    // Resolve project root: prefer PRICE_MIRROR_ROOT env, fall back to cwd.
    let project_root =
        PathBuf::from(std::env::var("PRICE_MIRROR_ROOT").unwrap_or_else(|_| ".".to_string()));
    run_cli(&project_root)
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(sources: &str, target: &str, contact_handle: &str) -> String {
        format_config(&ConfigParams {
            bot_token: "123:abc",
            sources,
            target,
            pro_delta: 2500,
            default_delta: 1000,
            contact_handle,
            db_path: "mirror.db",
        })
    }

    #[test]
    fn test_channels_section() {
        let out = cfg("-1001111, @supplier", "-1002222", "");
        assert!(out.contains("[channels]"));
        assert!(out.contains(r#"sources = ["-1001111", "@supplier"]"#));
        assert!(out.contains(r#"target = "-1002222""#));
    }

    #[test]
    fn test_pricing_section() {
        let out = cfg("@a", "@b", "");
        assert!(out.contains("[pricing]"));
        assert!(out.contains("pro_delta = 2500"));
        assert!(out.contains("default_delta = 1000"));
    }

    #[test]
    fn test_contact_handle_commented_when_empty() {
        let out = cfg("@a", "@b", "");
        assert!(out.contains("# contact_handle ="));
        assert!(!out.contains("\ncontact_handle = "));

        let out = cfg("@a", "@b", "@manager");
        assert!(out.contains(r#"contact_handle = "@manager""#));
    }

    #[test]
    fn test_output_is_valid_toml() {
        let out = cfg("@a \"quoted\"", "@b", "@m");
        let value: toml::Value = toml::from_str(&out).unwrap();
        assert_eq!(value["telegram"]["bot_token"].as_str(), Some("123:abc"));
        assert_eq!(value["storage"]["database_path"].as_str(), Some("mirror.db"));
    }

    #[test]
    fn test_existing_config_round_trip() {
        let out = cfg("-1001111, @supplier", "-1002222", "@manager");
        let existing = parse_existing(&out);
        assert_eq!(existing.bot_token, "123:abc");
        assert_eq!(existing.sources, "-1001111, @supplier");
        assert_eq!(existing.target, "-1002222");
        assert_eq!(existing.pro_delta, Some(2500));
        assert_eq!(existing.contact_handle, "@manager");
    }

    #[test]
    fn test_garbage_existing_config_ignored() {
        assert_eq!(parse_existing("not = [valid"), Existing::default());
    }
}
