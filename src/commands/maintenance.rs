use super::utils::spinner;
use chrono::Local;
use colored::Colorize;
use stowage::PackageManager;
use stowage::backup::prune_backups;

fn print_names(mark: colored::ColoredString, label: &str, names: &[String]) {
    if names.is_empty() {
        return;
    }
    println!("  {} {}: {}", mark, label, names.join(", ").bold());
}

pub async fn cleanup(pm: &PackageManager) -> anyhow::Result<()> {
    let pb = spinner("Reconciling installed packages");
    let report = pm.cleanup().await;
    pb.finish_and_clear();

    println!("{}", "==> Startup sweep".bold().green());
    print_names("✓".green(), "Applied pending package files", &report.swapped);
    print_names("✓".green(), "Finished removals", &report.deleted);
    print_names("✓".green(), "Finished installs", &report.reinstalled);
    print_names("✓".green(), "Removed orphaned", &report.removed_orphans);
    print_names("✓".green(), "Installed missing", &report.installed_missing);

    let pending: Vec<String> = report.pending.iter().cloned().collect();
    print_names("⟳".yellow(), "Still pending", &pending);

    if !report.incompatible.is_empty() {
        println!(
            "  {} {} packages are not compatible with this {} host (version {}):",
            "⚠".yellow(),
            report.incompatible.len().to_string().bold(),
            pm.host().platform,
            pm.host().version
        );
        for name in &report.incompatible {
            println!("    {name}");
        }
        println!("    Reinstall or remove them to restore a consistent state.");
    }

    if !report.pruned_backups.is_empty() {
        println!(
            "  {} Pruned {} old backups",
            "✓".green(),
            report.pruned_backups.len().to_string().bold()
        );
    }
    if !report.libraries_clean {
        println!("  {} Some unneeded libraries could not be removed", "⚠".yellow());
    }

    println!(
        "  {} packages, {} libraries",
        report.found_packages.len().to_string().bold(),
        report.found_libraries.len().to_string().bold()
    );
    Ok(())
}

pub fn prune(pm: &PackageManager, max_age_days: Option<u32>) -> anyhow::Result<()> {
    let max_age = max_age_days.unwrap_or(pm.config().max_backup_age);
    let pruned = prune_backups(pm.layout(), max_age, Local::now().date_naive());
    if pruned.is_empty() {
        println!("No backups older than {} days", max_age.to_string().bold());
        return Ok(());
    }
    for path in &pruned {
        println!("  {} {}", "✓".green(), path.display().to_string().dimmed());
    }
    println!("Removed {} backups", pruned.len().to_string().bold());
    Ok(())
}

pub fn config(pm: &PackageManager) -> anyhow::Result<()> {
    let layout = pm.layout();
    let host = pm.host();

    println!("{}", "==> Paths".bold().green());
    println!("  data:      {}", layout.root().display());
    println!("  settings:  {}", layout.settings_file().display());
    println!("  packages:  {}", layout.packages_dir().display());
    println!("  archives:  {}", layout.installed_packages_dir().display());
    println!("  libraries: {}", layout.lib_root().display());
    println!("  backups:   {}", layout.backup_dir().display());

    println!("{}", "==> Host".bold().green());
    println!("  platform:  {}-{}", host.platform, host.arch);
    println!("  version:   {}", host.version);

    println!("{}", "==> Settings".bold().green());
    let json = serde_json::to_string_pretty(pm.config())?;
    for line in json.lines() {
        println!("  {line}");
    }
    Ok(())
}
