/// Terminal color control honoring NO_COLOR and CLICOLOR
///
/// - `NO_COLOR` (any value) disables colors
/// - `CLICOLOR=0` disables colors
/// - `CLICOLOR_FORCE` (non-zero) forces colors when stdout is not a terminal
use colored::control;
use std::io::IsTerminal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColorChoice {
    Always,
    Never,
    Auto,
}

fn choose(no_color: bool, clicolor: Option<&str>, clicolor_force: Option<&str>) -> ColorChoice {
    if no_color {
        return ColorChoice::Never;
    }
    if clicolor_force.is_some_and(|v| v != "0") {
        return ColorChoice::Always;
    }
    if clicolor == Some("0") {
        return ColorChoice::Never;
    }
    ColorChoice::Auto
}

/// Configure `colored` for the whole process. Call once, early in main.
pub fn init_colors() {
    let clicolor = std::env::var("CLICOLOR").ok();
    let clicolor_force = std::env::var("CLICOLOR_FORCE").ok();
    let choice = choose(
        std::env::var_os("NO_COLOR").is_some(),
        clicolor.as_deref(),
        clicolor_force.as_deref(),
    );

    let enabled = match choice {
        ColorChoice::Always => true,
        ColorChoice::Never => false,
        ColorChoice::Auto => std::io::stdout().is_terminal(),
    };
    control::set_override(enabled);
}
