//! Scores an RFP's proposals against its budget and delivery targets.
//!
//! Each component only counts when its inputs are present:
//! - price: up to 30 points for coming in under budget, none when over
//! - completeness: `completenessScore / 100 * 30`
//! - delivery: up to 20 points for beating the requested days, none when late
//! - warranty: `warrantyMonths / 24 * 10`, capped at 10
//! - payment terms: a flat 10 when stated

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::models::{Proposal, Rfp, Vendor, VendorProposal};
use crate::store::{run_blocking, ProcurementStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum RankingError {
    #[error("rfp not found: {0}")]
    RfpNotFound(Uuid),
    #[error("no proposals found for rfp {0}")]
    NoProposals(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Recommendation {
    BestChoice,
    Consider,
    LeastSuitable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VendorSummary {
    pub id: Uuid,
    pub name: String,
    pub contact_email: String,
}

impl From<&Vendor> for VendorSummary {
    fn from(vendor: &Vendor) -> Self {
        Self {
            id: vendor.id,
            name: vendor.name.clone(),
            contact_email: vendor.contact_email.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedProposal {
    #[serde(flatten)]
    pub proposal: Proposal,
    pub vendor: VendorSummary,
    pub ranking_score: i64,
    pub ranking_reasons: Vec<String>,
    pub rank: usize,
    pub recommendation: Recommendation,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RfpSummary {
    pub id: Uuid,
    pub title: String,
    pub budget_usd: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingSummary {
    pub total_proposals: usize,
    pub best_vendor: Option<String>,
    pub best_score: Option<i64>,
    pub average_price: f64,
    pub recommendation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingReport {
    pub rfp: RfpSummary,
    pub ranked_proposals: Vec<RankedProposal>,
    pub summary: RankingSummary,
}

#[derive(Clone)]
pub struct ProposalRanker {
    store: Arc<dyn ProcurementStore>,
}

impl ProposalRanker {
    pub fn new(store: Arc<dyn ProcurementStore>) -> Self {
        Self { store }
    }

    pub async fn rank(&self, rfp_id: Uuid) -> Result<RankingReport, RankingError> {
        let (rfp, proposals) = run_blocking(&self.store, move |store| {
            let rfp = store.get_rfp(rfp_id)?;
            let proposals = match rfp {
                Some(_) => store.list_proposals_for_rfp(rfp_id)?,
                None => Vec::new(),
            };
            Ok((rfp, proposals))
        })
        .await?;
        let rfp = rfp.ok_or(RankingError::RfpNotFound(rfp_id))?;
        if proposals.is_empty() {
            return Err(RankingError::NoProposals(rfp_id));
        }
        Ok(rank_proposals(&rfp, proposals))
    }
}

/// Unrounded score and reasons for one proposal.
pub fn score_proposal(rfp: &Rfp, proposal: &Proposal) -> (f64, Vec<String>) {
    let fields = &proposal.fields;
    let mut score = 0.0;
    let mut reasons = Vec::new();

    if let (Some(price), Some(budget)) = (
        fields.price_usd.filter(|price| *price > 0.0),
        rfp.budget_usd.filter(|budget| *budget > 0.0),
    ) {
        let difference = budget - price;
        if difference >= 0.0 {
            score += (difference / budget * 30.0).min(30.0);
            if difference > 0.0 {
                reasons.push(format!("Under budget by ${}", format_usd(difference)));
            }
        } else {
            reasons.push(format!("Over budget by ${}", format_usd(-difference)));
        }
    }

    if let Some(completeness) = fields.completeness_score.filter(|value| *value > 0.0) {
        score += completeness / 100.0 * 30.0;
        let percent = completeness.round() as i64;
        let reason = if completeness >= 90.0 {
            format!("Excellent response completeness ({}%)", percent)
        } else if completeness >= 70.0 {
            format!("Good response completeness ({}%)", percent)
        } else {
            format!("Incomplete response ({}%)", percent)
        };
        reasons.push(reason);
    }

    if let (Some(offered), Some(requested)) = (
        fields.delivery_days.filter(|days| *days > 0),
        rfp.delivery_days.filter(|days| *days > 0),
    ) {
        let difference = requested - offered;
        if difference >= 0 {
            score += (f64::from(difference) / f64::from(requested) * 20.0).min(20.0);
            if difference > 0 {
                reasons.push(format!("{} days faster than requested", difference));
            }
        } else {
            reasons.push(format!("{} days slower than requested", -difference));
        }
    }

    if let Some(warranty) = fields.warranty_months.filter(|months| *months > 0) {
        score += (f64::from(warranty) / 24.0 * 10.0).min(10.0);
        if warranty >= 24 {
            reasons.push(format!("Excellent warranty coverage ({} months)", warranty));
        }
    }

    if fields
        .payment_terms
        .as_deref()
        .is_some_and(|terms| !terms.trim().is_empty())
    {
        score += 10.0;
        reasons.push("Clear payment terms provided".to_string());
    }

    (score, reasons)
}

/// Ranks proposals by descending score. Ties keep their input order.
pub fn rank_proposals(rfp: &Rfp, proposals: Vec<VendorProposal>) -> RankingReport {
    let mut scored: Vec<(i64, Vec<String>, VendorProposal)> = proposals
        .into_iter()
        .map(|entry| {
            let (score, reasons) = score_proposal(rfp, &entry.proposal);
            (score.round() as i64, reasons, entry)
        })
        .collect();
    scored.sort_by(|left, right| right.0.cmp(&left.0));

    let total = scored.len();
    let priced: Vec<f64> = scored
        .iter()
        .filter_map(|(_, _, entry)| entry.proposal.fields.price_usd)
        .collect();
    let average_price = if priced.is_empty() {
        0.0
    } else {
        priced.iter().sum::<f64>() / priced.len() as f64
    };

    let ranked_proposals: Vec<RankedProposal> = scored
        .into_iter()
        .enumerate()
        .map(|(index, (score, reasons, entry))| RankedProposal {
            vendor: VendorSummary::from(&entry.vendor),
            proposal: entry.proposal,
            ranking_score: score,
            ranking_reasons: reasons,
            rank: index + 1,
            recommendation: recommendation_for(index, total),
        })
        .collect();

    let best = ranked_proposals.first();
    let summary = RankingSummary {
        total_proposals: total,
        best_vendor: best.map(|entry| entry.vendor.name.clone()),
        best_score: best.map(|entry| entry.ranking_score),
        average_price,
        recommendation: best.map(summary_sentence),
    };

    RankingReport {
        rfp: RfpSummary {
            id: rfp.id,
            title: rfp.title.clone(),
            budget_usd: rfp.budget_usd,
        },
        ranked_proposals,
        summary,
    }
}

fn recommendation_for(index: usize, total: usize) -> Recommendation {
    if index == 0 {
        Recommendation::BestChoice
    } else if index + 1 == total {
        Recommendation::LeastSuitable
    } else {
        Recommendation::Consider
    }
}

fn summary_sentence(best: &RankedProposal) -> String {
    let mut sentence = format!(
        "{} offers the best overall value with a score of {}/100.",
        best.vendor.name, best.ranking_score
    );
    if !best.ranking_reasons.is_empty() {
        sentence.push(' ');
        sentence.push_str(&best.ranking_reasons.join(". "));
        sentence.push('.');
    }
    sentence
}

/// Formats a dollar amount with thousands separators and at most three
/// fraction digits, trailing zeros dropped.
pub fn format_usd(amount: f64) -> String {
    let thousandths = (amount.abs() * 1000.0).round() as u64;
    let whole = thousandths / 1000;
    let fraction = thousandths % 1000;

    let digits = whole.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (index, ch) in digits.chars().enumerate() {
        if index > 0 && (digits.len() - index) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    if fraction == 0 {
        return grouped;
    }
    let fraction = format!("{:03}", fraction);
    format!("{}.{}", grouped, fraction.trim_end_matches('0'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ProposalFields, Requirements};
    use chrono::Utc;
    use serde_json::Map;

    fn rfp(budget: Option<f64>, delivery: Option<i32>) -> Rfp {
        Rfp {
            id: Uuid::new_v4(),
            title: "Laptops".to_string(),
            description_raw: String::new(),
            requirements: Requirements::default(),
            budget_usd: budget,
            delivery_days: delivery,
            payment_terms: None,
            warranty_months: None,
            reference_token: "t".to_string(),
            created_by_id: Uuid::new_v4(),
            created_at: Utc::now(),
        }
    }

    fn entry(vendor_name: &str, fields: ProposalFields) -> VendorProposal {
        let vendor = Vendor {
            id: Uuid::new_v4(),
            name: vendor_name.to_string(),
            contact_email: format!("{}@vendor.test", vendor_name.to_ascii_lowercase()),
            phone: None,
            notes: None,
            metadata: Map::new(),
            created_at: Utc::now(),
        };
        VendorProposal {
            proposal: Proposal {
                id: Uuid::new_v4(),
                rfp_id: Uuid::nil(),
                vendor_id: vendor.id,
                sent_rfp_reference: None,
                raw_email_body: String::new(),
                attachments: Vec::new(),
                parsed_at: None,
                fields,
                created_at: Utc::now(),
            },
            vendor,
        }
    }

    fn three_way() -> (Rfp, Vec<VendorProposal>) {
        let rfp = rfp(Some(10_000.0), Some(10));
        let a = entry(
            "A",
            ProposalFields {
                price_usd: Some(9_000.0),
                completeness_score: Some(100.0),
                delivery_days: Some(5),
                warranty_months: Some(24),
                payment_terms: Some("Net 30".to_string()),
                ..Default::default()
            },
        );
        let b = entry(
            "B",
            ProposalFields {
                price_usd: Some(11_000.0),
                completeness_score: Some(50.0),
                delivery_days: Some(15),
                ..Default::default()
            },
        );
        let c = entry(
            "C",
            ProposalFields {
                completeness_score: Some(20.0),
                ..Default::default()
            },
        );
        (rfp, vec![c, b, a])
    }

    #[test]
    fn scores_follow_component_weights() {
        let (rfp, proposals) = three_way();
        let report = rank_proposals(&rfp, proposals);

        let scores: Vec<(&str, i64)> = report
            .ranked_proposals
            .iter()
            .map(|entry| (entry.vendor.name.as_str(), entry.ranking_score))
            .collect();
        // A: 3 + 30 + 10 + 10 + 10, B: 0 + 15 + 0, C: 6.
        assert_eq!(scores, vec![("A", 63), ("B", 15), ("C", 6)]);

        let best = &report.ranked_proposals[0];
        assert_eq!(best.rank, 1);
        assert_eq!(best.recommendation, Recommendation::BestChoice);
        assert_eq!(
            best.ranking_reasons,
            vec![
                "Under budget by $1,000",
                "Excellent response completeness (100%)",
                "5 days faster than requested",
                "Excellent warranty coverage (24 months)",
                "Clear payment terms provided",
            ]
        );
        assert_eq!(report.ranked_proposals[1].recommendation, Recommendation::Consider);
        assert_eq!(report.ranked_proposals[2].rank, 3);
        assert_eq!(
            report.ranked_proposals[2].recommendation,
            Recommendation::LeastSuitable
        );
    }

    #[test]
    fn over_budget_and_late_proposals_stay_ranked_with_reasons() {
        let (rfp, proposals) = three_way();
        let report = rank_proposals(&rfp, proposals);
        let b = report
            .ranked_proposals
            .iter()
            .find(|entry| entry.vendor.name == "B")
            .expect("B is ranked");
        assert_eq!(
            b.ranking_reasons,
            vec![
                "Over budget by $2,000",
                "Incomplete response (50%)",
                "5 days slower than requested",
            ]
        );
        assert_eq!(report.ranked_proposals.len(), 3);
    }

    #[test]
    fn summary_reports_best_vendor_and_average_price() {
        let (rfp, proposals) = three_way();
        let report = rank_proposals(&rfp, proposals);
        assert_eq!(report.summary.total_proposals, 3);
        assert_eq!(report.summary.best_vendor.as_deref(), Some("A"));
        assert_eq!(report.summary.best_score, Some(63));
        assert_eq!(report.summary.average_price, 10_000.0);
        assert_eq!(
            report.summary.recommendation.as_deref(),
            Some(
                "A offers the best overall value with a score of 63/100. Under budget by $1,000. \
                 Excellent response completeness (100%). 5 days faster than requested. \
                 Excellent warranty coverage (24 months). Clear payment terms provided."
            )
        );
    }

    #[test]
    fn ranking_is_deterministic_and_ties_keep_input_order() {
        let rfp = rfp(None, None);
        let proposals = vec![
            entry("First", ProposalFields::default()),
            entry("Second", ProposalFields::default()),
            entry("Third", ProposalFields::default()),
        ];
        let once = rank_proposals(&rfp, proposals.clone());
        let twice = rank_proposals(&rfp, proposals);
        assert_eq!(once, twice);
        let names: Vec<_> = once
            .ranked_proposals
            .iter()
            .map(|entry| entry.vendor.name.as_str())
            .collect();
        assert_eq!(names, vec!["First", "Second", "Third"]);
    }

    #[test]
    fn missing_targets_contribute_nothing() {
        let rfp = rfp(None, Some(0));
        let (score, reasons) = score_proposal(
            &rfp,
            &entry(
                "X",
                ProposalFields {
                    price_usd: Some(10.0),
                    delivery_days: Some(5),
                    warranty_months: Some(6),
                    ..Default::default()
                },
            )
            .proposal,
        );
        assert_eq!(score, 2.5);
        assert!(reasons.is_empty());
    }

    #[test]
    fn warranty_points_are_capped() {
        let rfp = rfp(None, None);
        let (score, reasons) = score_proposal(
            &rfp,
            &entry(
                "Y",
                ProposalFields {
                    warranty_months: Some(36),
                    ..Default::default()
                },
            )
            .proposal,
        );
        assert_eq!(score, 10.0);
        assert_eq!(reasons, vec!["Excellent warranty coverage (36 months)"]);
    }

    #[test]
    fn single_proposal_is_best_choice() {
        let report = rank_proposals(
            &rfp(Some(100.0), None),
            vec![entry("Solo", ProposalFields::default())],
        );
        assert_eq!(
            report.ranked_proposals[0].recommendation,
            Recommendation::BestChoice
        );
        assert_eq!(
            report.summary.recommendation.as_deref(),
            Some("Solo offers the best overall value with a score of 0/100.")
        );
    }

    #[tokio::test]
    async fn ranker_reports_missing_rfp_and_empty_rfp() {
        use crate::store::{InMemoryProcurementStore, ProcurementStore};
        use crate::models::{NewRfp, NewUser};

        let store = Arc::new(InMemoryProcurementStore::new());
        let ranker = ProposalRanker::new(store.clone());
        let missing = Uuid::new_v4();
        assert!(matches!(
            ranker.rank(missing).await,
            Err(RankingError::RfpNotFound(id)) if id == missing
        ));

        let user = store
            .get_or_create_user(&NewUser {
                email: "buyer@example.com".to_string(),
                username: "buyer".to_string(),
                name: None,
                credential: "x".to_string(),
            })
            .expect("user");
        let rfp = store
            .create_rfp(&NewRfp {
                title: "Chairs".to_string(),
                description_raw: "10 chairs".to_string(),
                requirements: Requirements::default(),
                budget_usd: None,
                delivery_days: None,
                payment_terms: None,
                warranty_months: None,
                reference_token: "chairs".to_string(),
                created_by_id: user.id,
            })
            .expect("rfp");
        assert!(matches!(
            ranker.rank(rfp.id).await,
            Err(RankingError::NoProposals(id)) if id == rfp.id
        ));
    }

    #[test]
    fn usd_formatting() {
        assert_eq!(format_usd(5000.0), "5,000");
        assert_eq!(format_usd(1234567.5), "1,234,567.5");
        assert_eq!(format_usd(999.0), "999");
        assert_eq!(format_usd(0.125), "0.125");
    }

    #[test]
    fn ranked_proposal_serializes_flat() {
        let (rfp, proposals) = three_way();
        let report = rank_proposals(&rfp, proposals);
        let value = serde_json::to_value(&report).expect("serialize");
        let best = &value["rankedProposals"][0];
        assert_eq!(best["rankingScore"], serde_json::json!(63));
        assert_eq!(best["recommendation"], serde_json::json!("BEST_CHOICE"));
        assert_eq!(best["priceUsd"], serde_json::json!(9000.0));
        assert_eq!(best["vendor"]["name"], serde_json::json!("A"));
        assert_eq!(value["summary"]["bestVendor"], serde_json::json!("A"));
    }
}
