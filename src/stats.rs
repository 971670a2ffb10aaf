//! Tree Statistics Aggregator and team report
//!
//! Both are pure functions over a borrowed tree. Amounts are summed as
//! `Decimal`, so thousands of 18-decimal earnings add up exactly. Sums
//! saturate at `Decimal::MAX` instead of overflowing.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use genealogy_types::{NetworkNode, NodeId, PackageTier, Rank};
use rust_decimal::Decimal;
use serde::Serialize;

/// Entries in each top-N list of the team report
const TOP_N: usize = 10;

/// Minimum earnings (token units) to count as a top performer
const TOP_PERFORMER_EARNINGS: i64 = 100;

/// Minimum investment (token units) to count as a big investor
const BIG_INVESTOR_AMOUNT: i64 = 200;

/// Joined within this many days to count as a recent joiner
const RECENT_JOINER_DAYS: i64 = 7;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TreeStats {
    /// Every node including the root
    pub total_nodes: usize,
    pub active_nodes: usize,
    pub inactive_nodes: usize,
    pub max_depth: u32,
    pub total_earnings: Decimal,
    pub total_investment: Decimal,
    /// Depth → node count
    pub level_distribution: BTreeMap<u32, usize>,
    pub package_distribution: BTreeMap<PackageTier, usize>,
}

/// Single pass over the tree (explicit stack, no recursion).
///
/// A root-only tree yields `total_nodes = 1`, `max_depth` equal to the root
/// depth, and the root's own attributes as the only contribution.
pub fn aggregate(tree: &NetworkNode) -> TreeStats {
    let mut stats = TreeStats::default();
    for node in tree.iter() {
        let attrs = &node.attributes;
        stats.total_nodes += 1;
        if attrs.active {
            stats.active_nodes += 1;
        } else {
            stats.inactive_nodes += 1;
        }
        stats.max_depth = stats.max_depth.max(node.depth);
        stats.total_earnings = stats.total_earnings.saturating_add(attrs.earnings);
        stats.total_investment = stats.total_investment.saturating_add(attrs.total_investment);
        *stats.level_distribution.entry(node.depth).or_default() += 1;
        *stats.package_distribution.entry(attrs.package).or_default() += 1;
    }
    stats
}

/// Compact member line used in the team report lists
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberSummary {
    pub id: NodeId,
    /// Levels below the report root
    pub level: u32,
    pub package: PackageTier,
    pub rank: Rank,
    pub earnings: Decimal,
    pub total_investment: Decimal,
    pub joined_at: Option<DateTime<Utc>>,
}

impl MemberSummary {
    fn of(node: &NetworkNode, root_depth: u32) -> Self {
        Self {
            id: node.id.clone(),
            level: node.depth - root_depth,
            package: node.attributes.package,
            rank: node.attributes.rank,
            earnings: node.attributes.earnings,
            total_investment: node.attributes.total_investment,
            joined_at: node.attributes.joined_at,
        }
    }
}

/// Downline summary of a root (the root itself is not counted)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TeamReport {
    pub total_members: usize,
    pub active_members: usize,
    pub inactive_members: usize,
    /// Level below the root → member count
    pub level_distribution: BTreeMap<u32, usize>,
    pub package_distribution: BTreeMap<PackageTier, usize>,
    pub total_earnings: Decimal,
    pub total_investment: Decimal,
    pub average_investment: Decimal,
    pub top_performers: Vec<MemberSummary>,
    pub recent_joiners: Vec<MemberSummary>,
    pub biggest_investors: Vec<MemberSummary>,
}

pub fn team_report(tree: &NetworkNode, now: DateTime<Utc>) -> TeamReport {
    let mut report = TeamReport::default();
    let mut members: Vec<MemberSummary> = Vec::new();
    let recent_cutoff = now - Duration::days(RECENT_JOINER_DAYS);

    for node in tree.iter().skip(1) {
        let attrs = &node.attributes;
        let summary = MemberSummary::of(node, tree.depth);

        report.total_members += 1;
        if attrs.active {
            report.active_members += 1;
        } else {
            report.inactive_members += 1;
        }
        *report.level_distribution.entry(summary.level).or_default() += 1;
        *report.package_distribution.entry(attrs.package).or_default() += 1;
        report.total_earnings = report.total_earnings.saturating_add(attrs.earnings);
        report.total_investment = report.total_investment.saturating_add(attrs.total_investment);
        members.push(summary);
    }

    if report.total_members > 0 {
        report.average_investment = report.total_investment / Decimal::from(report.total_members);
    }

    let performer_floor = Decimal::from(TOP_PERFORMER_EARNINGS);
    report.top_performers = top_by(&members, |m| m.earnings > performer_floor, |a, b| b.earnings.cmp(&a.earnings));

    report.recent_joiners = top_by(
        &members,
        |m| m.joined_at.is_some_and(|at| at >= recent_cutoff),
        |a, b| b.joined_at.cmp(&a.joined_at),
    );

    let investor_floor = Decimal::from(BIG_INVESTOR_AMOUNT);
    report.biggest_investors = top_by(
        &members,
        |m| m.total_investment > investor_floor,
        |a, b| b.total_investment.cmp(&a.total_investment),
    );

    report
}

/// Filter, stable sort and keep the first `TOP_N`
fn top_by<F, C>(members: &[MemberSummary], keep: F, order: C) -> Vec<MemberSummary>
where
    F: Fn(&MemberSummary) -> bool,
    C: Fn(&MemberSummary, &MemberSummary) -> std::cmp::Ordering,
{
    let mut picked: Vec<MemberSummary> = members.iter().filter(|m| keep(m)).cloned().collect();
    picked.sort_by(|a, b| order(a, b));
    picked.truncate(TOP_N);
    picked
}
