use std::env;
use std::io::{self, Write};

fn banner_text(suffix: &str) -> String {
    let no_color = env::var("NO_COLOR").is_ok();
    let (c, r) = if no_color {
        ("", "")
    } else {
        ("\x1b[93m", "\x1b[0m")
    };
    let logo = concat!(
        " ____   ____ ____            __ _   \n",
        "|  _ \\ / ___|  _ \\ __ _ / _| |_ \n",
        "| |_) | |   | |_) / _` | |_| __|\n",
        "|  __/| |___|  _ < (_| |  _| |_ \n",
        "|_|    \\____|_| \\_\\__,_|_|  \\__|\n",
    );
    format!("\n{c}{logo}{r}⚒  {suffix}\n")
}

pub fn print_banner() {
    let _ = io::stdout().write_all(banner_text("PCRAFT console – macro automation engine").as_bytes());
}

/// Keeps stdout clean for `run`/`check` output.
pub fn print_banner_stderr() {
    let _ = io::stderr().write_all(banner_text("PCRAFT – macro automation engine").as_bytes());
}

pub fn print_server_banner() {
    let _ = io::stdout().write_all(banner_text("PCRAFT control API").as_bytes());
}
