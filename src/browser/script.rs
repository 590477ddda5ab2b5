use std::time::Duration;

use crate::cli::config::{RenderSettings, SiteSettings};
use crate::crawler::task::{CrawlTask, TaskKind};

/// One declarative instruction executed by the render transport.
/// Keeping the page script as data means the wait/scroll/settle sequence can
/// be asserted in tests without a real browser behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderStep {
    /// Block until the selector matches an element in the DOM, bounded by
    /// the timeout
    WaitForSelector {
        selector: String,
        timeout: Duration,
    },
    /// One full-page scroll to the bottom, to trigger lazy-loaded content
    ScrollToBottom,
    /// Fixed delay before snapshotting the DOM
    Settle(Duration),
}

/// Ordered render script for one task
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderPlan {
    pub steps: Vec<RenderStep>,
}

impl RenderPlan {
    /// Build the render script for a task.
    ///
    /// ROOT pages wait for the product-link selector, scroll once, then
    /// settle so lazy-loaded tiles finish rendering. DETAIL pages only wait
    /// for the structured-data block.
    pub fn for_task(task: &CrawlTask, site: &SiteSettings, render: &RenderSettings) -> Self {
        let timeout = Duration::from_secs(render.wait_timeout_secs);

        let selector = match task.kind {
            TaskKind::Root => site.product_link_selector.clone(),
            TaskKind::Detail => site.structured_data_selector.clone(),
        };

        let mut steps = vec![RenderStep::WaitForSelector { selector, timeout }];

        if task.scroll {
            steps.push(RenderStep::ScrollToBottom);
        }

        if task.render_wait_ms > 0 {
            steps.push(RenderStep::Settle(Duration::from_millis(task.render_wait_ms)));
        }

        Self { steps }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::config::CrawlerConfig;

    #[test]
    fn root_plan_waits_scrolls_and_settles() {
        let config = CrawlerConfig::default();
        let task = CrawlTask::root(&config.site.root_url, config.render.settle_secs);

        let plan = RenderPlan::for_task(&task, &config.site, &config.render);

        assert_eq!(
            plan.steps,
            vec![
                RenderStep::WaitForSelector {
                    selector: ".pdp-link a".to_string(),
                    timeout: Duration::from_secs(60),
                },
                RenderStep::ScrollToBottom,
                RenderStep::Settle(Duration::from_secs(30)),
            ]
        );
    }

    #[test]
    fn detail_plan_only_waits_for_structured_data() {
        let config = CrawlerConfig::default();
        let task = CrawlTask::detail("https://www.cyamoda.com/p/123.html");

        let plan = RenderPlan::for_task(&task, &config.site, &config.render);

        assert_eq!(
            plan.steps,
            vec![RenderStep::WaitForSelector {
                selector: "script[type='application/ld+json']".to_string(),
                timeout: Duration::from_secs(60),
            }]
        );
    }
}
