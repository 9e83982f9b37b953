use chrono::{Duration, Utc};
use color_eyre::eyre::{eyre, Report};
use vigil_agent::{Labels, MetricStore, ScrapeTarget, Selector};

fn main() -> Result<(), Report> {
    color_eyre::install()?;
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();

    let url = std::env::args()
        .nth(1)
        .ok_or_else(|| eyre!("Usage: scrape_once <metrics_url>"))?;
    rt.block_on(async move {
        let store = MetricStore::new();
        let target = ScrapeTarget::new(
            url.as_str(),
            std::time::Duration::from_secs(10),
            Labels::new(),
            store.clone(),
        )?;
        let appended = target.scrape_once().await?;
        println!("appended {} points across {} series", appended, store.series_count());

        let up = store.latest(
            &Selector::new("up", Labels::new()),
            Utc::now(),
            Duration::minutes(5),
        );
        for (id, point) in up {
            println!("{} = {}", id, point.value);
        }
        Ok::<_, Report>(())
    })?;
    Ok(())
}
