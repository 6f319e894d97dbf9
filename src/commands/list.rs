use super::utils::is_tty;
use colored::Colorize;
use stowage::PackageManager;

pub fn list(pm: &PackageManager, unpacked_only: bool, outdated: bool) -> anyhow::Result<()> {
    if outdated {
        let packages = pm.list_outdated();
        if packages.is_empty() {
            if is_tty() {
                println!("{} All packages are up to date", "✓".green());
            }
            return Ok(());
        }
        for package in packages {
            if is_tty() {
                println!(
                    "{} {} → {}",
                    package.name.bold(),
                    package.installed.dimmed(),
                    package.latest.cyan()
                );
            } else {
                println!("{}\t{}\t{}", package.name, package.installed, package.latest);
            }
        }
        return Ok(());
    }

    let names = pm.list_packages(unpacked_only);
    if names.is_empty() {
        if is_tty() {
            println!("No packages installed");
        }
        return Ok(());
    }

    // Piped output is one name per line for scripting.
    if !is_tty() {
        for name in &names {
            println!("{name}");
        }
        return Ok(());
    }

    println!("{}", "==> Installed packages".bold().green());
    for name in &names {
        let metadata = pm.get_metadata(name);
        let version = metadata.version.unwrap_or_else(|| "unmanaged".to_string());
        let registered = if pm.registry().contains(name) {
            String::new()
        } else {
            format!(" {}", "(not in registry)".yellow())
        };
        println!("  {} {}{}", name.bold(), version.dimmed(), registered);
    }
    Ok(())
}

pub fn libraries(pm: &PackageManager, orphaned: bool) -> anyhow::Result<()> {
    let libs = if orphaned {
        let required = pm.find_required_libraries(None);
        pm.find_orphaned_libraries(&required)
    } else {
        pm.list_libraries()
    };

    if libs.is_empty() {
        if is_tty() {
            println!("No libraries found");
        }
        return Ok(());
    }

    if is_tty() {
        let title = if orphaned {
            "==> Unneeded libraries"
        } else {
            "==> Installed libraries"
        };
        println!("{}", title.bold().green());
    }
    for lib in libs {
        if is_tty() {
            println!("  {} {}", lib.name.bold(), format!("python {}", lib.python_version).dimmed());
        } else {
            println!("{}\t{}", lib.name, lib.python_version);
        }
    }
    Ok(())
}
