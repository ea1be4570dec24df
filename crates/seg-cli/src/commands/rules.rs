//! Rules command for showing the configured activity rule table.

use std::io::Write;

use anyhow::Result;
use seg_core::{ActivityRule, RuleStep};

fn format_step(step: &RuleStep) -> String {
    let roles = step.roles.join(", ");
    match step.within {
        Some(within) => format!("{}({roles}) within {within:.3} s", step.event),
        None => format!("{}({roles})", step.event),
    }
}

/// Format rules in evaluation order.
pub fn write_rules<W: Write>(writer: &mut W, rules: &[ActivityRule]) -> Result<()> {
    writeln!(writer, "RULES")?;

    if rules.is_empty() {
        writeln!(writer)?;
        writeln!(writer, "No activity rules configured.")?;
        return Ok(());
    }

    for rule in rules {
        writeln!(writer)?;
        writeln!(
            writer,
            "{}  (priority {}, span {:.3} s)",
            rule.name,
            rule.priority,
            rule.span()
        )?;
        for (position, step) in rule.steps.iter().enumerate() {
            writeln!(writer, "  {}. {}", position + 1, format_step(step))?;
        }
        if !rule.role_kinds.is_empty() {
            let kinds: Vec<String> = rule
                .role_kinds
                .iter()
                .map(|(role, kind)| format!("{role}={kind}"))
                .collect();
            writeln!(writer, "  kinds: {}", kinds.join(" "))?;
        }
    }
    Ok(())
}

/// Runs the rules command.
pub fn run<W: Write>(writer: &mut W, rules: &[ActivityRule], json: bool) -> Result<()> {
    if json {
        writeln!(writer, "{}", serde_json::to_string_pretty(rules)?)?;
    } else {
        write_rules(writer, rules)?;
    }
    Ok(())
}
