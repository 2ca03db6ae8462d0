use std::path::PathBuf;

use strata_core::config;

pub(crate) fn run_config_generate(dest: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let path = match dest {
        Some(d) => PathBuf::from(d),
        None => default_location()?,
    };

    if path.exists() {
        return Err(format!("file already exists: {}", path.display()).into());
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }

    std::fs::write(&path, config::minimal_config_template())?;
    println!("Config written to: {}", path.display());
    println!("Edit it to set your repository location.");
    Ok(())
}

fn default_location() -> Result<PathBuf, Box<dyn std::error::Error>> {
    config::default_config_search_paths()
        .into_iter()
        .next()
        .map(|(path, _)| path)
        .ok_or_else(|| "no default config location".into())
}
