use std::time::Duration;

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tarr_auth_bridge::{DeviceCodeNotifier, DevicePrompt};

/// Print success message
pub fn success(msg: &str) {
    println!("{} {}", style("✔").green(), msg);
}

/// Print error message
pub fn error(msg: &str) {
    println!("{} {}", style("✖").red(), msg);
}

pub fn warning(msg: &str) {
    println!("{} {}", style("!").yellow(), msg);
}

/// Print info message (indented)
pub fn info(msg: &str) {
    println!("  {}", msg);
}

/// Print dimmed, indented text such as a reply body
pub fn quote(text: &str) {
    for line in text.lines() {
        println!("    {}", style(line).dim());
    }
}

/// Create a spinner for indeterminate progress
pub fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg} {elapsed:.dim}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

/// Device code prompt on stderr, so `--json` output stays clean.
pub struct ConsoleNotifier;

impl DeviceCodeNotifier for ConsoleNotifier {
    fn notify(&self, prompt: &DevicePrompt) {
        eprintln!();
        eprintln!("  {}", style("Sign in to Microsoft Graph").bold());
        eprintln!("  Open {}", style(&prompt.verification_uri).cyan().underlined());
        eprintln!("  Enter code {}", style(&prompt.user_code).bold().green());
        eprintln!(
            "  {}",
            style(format!("Code expires in {} minutes", prompt.expires_in.as_secs() / 60)).dim()
        );
        eprintln!();
    }
}
