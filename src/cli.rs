use clap::Parser;

use crate::escape;

#[derive(Parser, Debug)]
#[command(author, version, long_about = None)]
#[command(
    about = "Anonymizes keyboard and mouse input patterns by injecting jitter \
             into input events. Designed specifically for wlroots-based Wayland \
             compositors. Will NOT work with X11."
)]
pub struct Cli {
    /// Maximum delay of released events, in milliseconds.
    #[arg(short, long, default_value_t = 100, value_parser = parse_uint31)]
    pub delay: i64,
    /// Time to wait before startup, in milliseconds.
    #[arg(short, long, default_value_t = 500, value_parser = parse_uint31)]
    pub start_delay: i64,
    /// Color of the virtual mouse cursor, as AARRGGBB hex.
    #[arg(short, long, default_value = "ffff0000", value_parser = parse_color)]
    pub color: u32,
    /// Key combination that terminates shroud. Keys are separated by commas;
    /// keys can be aliased to each other by separating them with a pipe (|)
    /// character.
    #[arg(short = 'k', long, default_value = escape::DEFAULT_COMBO)]
    pub esc_key_combo: String,
}

fn parse_uint31(val: &str) -> Result<i64, String> {
    match val.parse::<u64>() {
        Ok(parsed) if parsed <= i32::MAX as u64 => Ok(parsed as i64),
        _ => Err(format!("invalid value '{val}'")),
    }
}

fn parse_color(val: &str) -> Result<u32, String> {
    u32::from_str_radix(val, 16).map_err(|_| format!("invalid value '{val}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cli = Cli::try_parse_from(["shroud"]).unwrap();
        assert_eq!(cli.delay, 100);
        assert_eq!(cli.start_delay, 500);
        assert_eq!(cli.color, 0xffff0000);
        assert_eq!(cli.esc_key_combo, escape::DEFAULT_COMBO);
    }

    #[test]
    fn parses_flags() {
        let cli = Cli::try_parse_from([
            "shroud",
            "--delay=250",
            "--start-delay=0",
            "--color=80ff00ff",
            "--esc-key-combo=KEY_LEFTCTRL,KEY_ESC",
        ])
        .unwrap();
        assert_eq!(cli.delay, 250);
        assert_eq!(cli.start_delay, 0);
        assert_eq!(cli.color, 0x80ff00ff);
        assert_eq!(cli.esc_key_combo, "KEY_LEFTCTRL,KEY_ESC");
    }

    #[test]
    fn rejects_out_of_range_delay() {
        assert!(Cli::try_parse_from(["shroud", "--delay=2147483648"]).is_err());
        assert!(Cli::try_parse_from(["shroud", "--delay=-5"]).is_err());
    }

    #[test]
    fn rejects_bad_color() {
        assert!(Cli::try_parse_from(["shroud", "--color=red"]).is_err());
        assert!(Cli::try_parse_from(["shroud", "--color=fffffffff"]).is_err());
    }
}
