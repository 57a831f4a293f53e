use meridian::stress_test::{soak_scaling, soak_test};
use std::error::Error;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,meridian_global=warn")),
        )
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async_main())
}

async fn async_main() -> Result<(), Box<dyn Error>> {
    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║            GLOBAL TABLE SOAK TESTS                         ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    let mut converged = true;

    // Test 1: three regions, small key space (many conflicts)
    let stats = soak_test(3, 200, 20, 200, None).await?;
    stats.print();
    converged &= stats.converged;

    // Test 2: five regions with store latency to interleave writers
    let stats = soak_test(5, 300, 200, 200, Some(Duration::from_micros(50))).await?;
    stats.print();
    converged &= stats.converged;

    // Test 3: scaling analysis
    converged &= soak_scaling(8, 2).await?;

    if !converged {
        return Err("replicas diverged in at least one soak run".into());
    }
    println!("\n✓ All soak tests completed successfully!");
    Ok(())
}
