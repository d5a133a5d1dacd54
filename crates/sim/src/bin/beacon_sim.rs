//! beacon scheduling demo for a multi-BSS radio

use anyhow::Result;
use colored::Colorize;
use tbtt_sim::{scenarios, ScenarioPresets};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    println!("{}", "Multi-BSS Beacon Scheduling Demo".bright_blue().bold());
    println!("{}", "================================".bright_blue());

    let mut reports = Vec::new();

    println!(
        "{}",
        "\n>>> Scenario: Staggered Multi-BSS".bright_green().bold()
    );
    reports.push(scenarios::staggered_multi_bss(ScenarioPresets::staggered_multi_bss(), 3).await);
    println!("{}", "-".repeat(50));

    println!(
        "{}",
        "\n>>> Scenario: Burst Mode Under the Trigger Loop"
            .bright_green()
            .bold()
    );
    reports.push(scenarios::burst_trigger_loop(ScenarioPresets::burst_multi_bss(), 3).await);
    println!("{}", "-".repeat(50));

    println!(
        "{}",
        "\n>>> Scenario: DTIM-Gated Group Traffic"
            .bright_green()
            .bold()
    );
    reports.push(scenarios::dtim_cab_delivery(ScenarioPresets::dtim_every_other()).await);
    println!("{}", "-".repeat(50));

    println!(
        "{}",
        "\n>>> Scenario: Stuck Beacon Recovery".bright_red().bold()
    );
    reports.push(scenarios::stuck_beacon_recovery(ScenarioPresets::staggered_multi_bss()).await);
    println!("{}", "-".repeat(50));

    println!(
        "{}",
        "\n>>> Scenario: Power-Save Station Timers"
            .bright_green()
            .bold()
    );
    reports.push(scenarios::station_power_save(ScenarioPresets::power_save_station()).await);
    println!("{}", "-".repeat(50));

    println!("{}", "\nAll scenarios complete!".bright_green().bold());
    println!("\n{}", "Totals:".bright_yellow());
    for r in &reports {
        println!(
            "- {:<22} {:>3} triggers, {:>3} beacons, {:>2} CAB bursts, {:>2} drained, {} resets",
            r.name, r.triggers, r.beacons, r.cab_bursts, r.cab_drained, r.resets
        );
    }

    Ok(())
}
