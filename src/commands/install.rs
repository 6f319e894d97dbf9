use super::utils::{print_release_notes, report_outcomes, spinner};
use anyhow::bail;
use colored::Colorize;
use stowage::{Outcome, PackageManager};

fn finish(pm: &PackageManager, verb: &str, results: &[(String, Outcome)]) -> anyhow::Result<()> {
    let failures = report_outcomes(pm, results);
    print_release_notes(pm);

    let deferred = results.iter().filter(|(_, o)| o.is_deferred()).count();
    if deferred > 0 {
        println!(
            "\n{} {} will finish the next time stowage starts",
            "ℹ".blue(),
            deferred.to_string().bold()
        );
    }
    if failures > 0 {
        bail!("{verb} failed for {failures} of {} packages", results.len());
    }
    Ok(())
}

pub async fn install(pm: &PackageManager, names: &[String]) -> anyhow::Result<()> {
    println!("Installing {} packages...", names.len().to_string().bold());
    let pb = spinner("Downloading and extracting");
    let results = pm.install_packages(names).await;
    pb.finish_and_clear();
    finish(pm, "install", &results)
}

pub async fn reinstall(pm: &PackageManager, names: &[String]) -> anyhow::Result<()> {
    println!("Reinstalling {} packages...", names.len().to_string().bold());
    let pb = spinner("Downloading and extracting");
    let results = pm.reinstall_packages(names).await;
    pb.finish_and_clear();
    finish(pm, "reinstall", &results)
}

/// Upgrade the named packages, or everything outdated.
pub async fn upgrade(pm: &PackageManager, names: &[String]) -> anyhow::Result<()> {
    if names.is_empty() {
        let outdated = pm.list_outdated();
        if outdated.is_empty() {
            println!("{} All packages are up to date", "✓".green());
            return Ok(());
        }
        println!("Upgrading {} outdated packages:", outdated.len().to_string().bold());
        for package in &outdated {
            println!(
                "  {} {} → {}",
                package.name.bold(),
                package.installed.dimmed(),
                package.latest.cyan()
            );
        }
    } else {
        println!("Upgrading {} packages...", names.len().to_string().bold());
    }

    let pb = spinner("Upgrading");
    let results = pm.upgrade_packages(names).await;
    pb.finish_and_clear();
    finish(pm, "upgrade", &results)
}

pub async fn remove(pm: &PackageManager, names: &[String]) -> anyhow::Result<()> {
    println!("Removing {} packages...", names.len().to_string().bold());
    let results = pm.remove_packages(names).await;
    finish(pm, "removal", &results)
}
