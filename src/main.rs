//! CLI Entry Point for the VXM stage driver
//!
//! Provides command-line access to:
//! - Homing all three axes
//! - Relative moves in millimeters or inches
//! - Position queries
//! - Velocity configuration
//! - The bench demo sequence (home, step each axis out, home again)
//!
//! # Usage
//!
//! ```bash
//! vxm --config config/vxm.toml home
//! vxm move X 1 --unit in
//! vxm position --unit mm
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use vxm_stage::{config::StageConfig, logging, Axis, StageController, Unit};

#[derive(Parser)]
#[command(name = "vxm")]
#[command(about = "Control a three-axis Velmex VXM stage", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = vxm_stage::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Serial port, overriding the configuration
    #[arg(long)]
    port: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Return X, Y and Z to zero
    Home,

    /// Move one axis by a relative distance
    Move {
        /// Axis (X, Y or Z)
        axis: Axis,
        /// Distance, negative to reverse
        #[arg(allow_hyphen_values = true)]
        distance: f64,
        /// Unit of the distance (mm or in)
        #[arg(long, default_value = "mm")]
        unit: Unit,
    },

    /// Report positions
    Position {
        /// Only this axis
        axis: Option<Axis>,
        /// Unit to report in (mm or in)
        #[arg(long, default_value = "mm")]
        unit: Unit,
    },

    /// Set the velocity of every axis (steps/second)
    Velocity {
        /// Speed in 1..=6000
        speed: i64,
    },

    /// Home, move X 1 in, Y 2 in, Z 2.5 in reporting each, then home again
    Demo,

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli)?;
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;

    if let Commands::Config = cli.command {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let stage = StageController::connect(&config)
        .await
        .with_context(|| format!("Failed to connect to stage on {}", config.connection.port))?;

    let result = run(&stage, cli.command).await;
    stage.close().await.context("Failed to release stage channel")?;
    result
}

/// Load the configuration file, apply command-line overrides and re-validate.
fn load_config(cli: &Cli) -> Result<StageConfig> {
    let mut config = StageConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load config {}", cli.config.display()))?;
    if let Some(port) = &cli.port {
        config.connection.port = port.clone();
    }
    config
        .validate()
        .context("Invalid configuration after command-line overrides")?;
    Ok(config)
}

async fn run(stage: &StageController, command: Commands) -> Result<()> {
    match command {
        Commands::Home => {
            stage.home_all().await?;
            report_all(stage, Unit::Millimeters).await
        }
        Commands::Move {
            axis,
            distance,
            unit,
        } => {
            let steps = stage.move_relative(axis, distance, unit).await?;
            println!("Moved {} by {} steps", axis, steps);
            let reading = stage.query_position(axis, unit).await?;
            println!("{}", reading);
            Ok(())
        }
        Commands::Position { axis: Some(axis), unit } => {
            let reading = stage.query_position(axis, unit).await?;
            println!("{}", reading);
            Ok(())
        }
        Commands::Position { axis: None, unit } => report_all(stage, unit).await,
        Commands::Velocity { speed } => {
            stage.set_velocity_all(speed).await?;
            println!("Velocity of all axes set to {} steps/s", speed);
            Ok(())
        }
        Commands::Demo => demo(stage).await,
        Commands::Config => Ok(()),
    }
}

async fn report_all(stage: &StageController, unit: Unit) -> Result<()> {
    let (x, y, z) = stage.query_all_positions(unit).await?;
    println!("Stage Positions: X={x:.6}{unit} Y={y:.6}{unit} Z={z:.6}{unit}");
    Ok(())
}

async fn demo(stage: &StageController) -> Result<()> {
    stage.home_all().await?;
    report_all(stage, Unit::Millimeters).await?;

    for (axis, inches) in [(Axis::X, 1.0), (Axis::Y, 2.0), (Axis::Z, 2.5)] {
        stage.move_relative(axis, inches, Unit::Inches).await?;
        println!("{}", stage.query_position(axis, Unit::Inches).await?);
    }

    stage.home_all().await?;
    report_all(stage, Unit::Millimeters).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(config: PathBuf, port: Option<&str>) -> Cli {
        Cli {
            config,
            port: port.map(str::to_string),
            command: Commands::Config,
        }
    }

    #[test]
    fn port_override_replaces_configured_port() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&cli(dir.path().join("vxm.toml"), Some("/dev/ttyS3"))).unwrap();
        assert_eq!(config.connection.port, "/dev/ttyS3");
    }

    #[test]
    fn empty_port_override_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(&cli(dir.path().join("vxm.toml"), Some(""))).unwrap_err();
        assert!(format!("{:#}", err).contains("connection.port"));
    }
}
