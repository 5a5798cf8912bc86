//! Resolves view preferences into the cost formula the query builder folds
//! into its aggregation.
//!
//! Precedence, per flag: request override, then the view's preference, then
//! the account default, then the built-in fallback.

use crate::settings_cache::AccountSettings;
use crate::views::{columns, AwsCostBasis, CostView, ViewPreferences};

pub const CLOUD_PROVIDER_AWS: &str = "AWS";
pub const CLOUD_PROVIDER_GCP: &str = "GCP";

/// Account setting identifiers, lowercase.
pub mod settings {
    pub const INCLUDE_OTHERS: &str = "include_others";
    pub const INCLUDE_UNALLOCATED_COST: &str = "include_unallocated_cost";
    pub const INCLUDE_AWS_DISCOUNTS: &str = "include_aws_discounts";
    pub const INCLUDE_AWS_CREDITS: &str = "include_aws_credit";
    pub const INCLUDE_AWS_REFUNDS: &str = "include_aws_refunds";
    pub const INCLUDE_AWS_TAXES: &str = "include_aws_taxes";
    pub const SHOW_AWS_COST_AS: &str = "show_aws_cost_as";
    pub const INCLUDE_GCP_DISCOUNTS: &str = "include_gcp_discounts";
    pub const INCLUDE_GCP_TAXES: &str = "include_gcp_taxes";
}

const AWS_DISCOUNT_TYPES: &[&str] = &[
    "EdpDiscount",
    "BundledDiscount",
    "PrivateRateDiscount",
    "RiVolumeDiscount",
];
const AWS_CREDIT_TYPES: &[&str] = &["Credit"];
const AWS_REFUND_TYPES: &[&str] = &["Refund"];
const AWS_TAX_TYPES: &[&str] = &["Tax"];
const GCP_TAX_TYPES: &[&str] = &["tax"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CostOp {
    Add,
    Subtract,
}

/// `column IN (values)` (or `NOT IN`) with NULL treated as the empty string.
#[derive(Debug, Clone, PartialEq)]
pub struct RowMatch {
    pub column: String,
    pub values: Vec<String>,
    pub negated: bool,
}

impl RowMatch {
    pub fn is_in(column: &str, values: &[&str]) -> Self {
        Self {
            column: column.to_string(),
            values: values.iter().map(|v| v.to_string()).collect(),
            negated: false,
        }
    }

    pub fn not_in(column: &str, values: &[&str]) -> Self {
        Self {
            negated: true,
            ..Self::is_in(column, values)
        }
    }
}

/// One signed component of the cost formula; `filter` is a conjunction and
/// an empty filter matches every row.
#[derive(Debug, Clone, PartialEq)]
pub struct CostTerm {
    pub column: String,
    pub op: CostOp,
    pub filter: Vec<RowMatch>,
}

impl CostTerm {
    pub fn add(column: &str) -> Self {
        Self {
            column: column.to_string(),
            op: CostOp::Add,
            filter: Vec::new(),
        }
    }

    pub fn subtract(column: &str) -> Self {
        Self {
            op: CostOp::Subtract,
            ..Self::add(column)
        }
    }

    pub fn filtered(mut self, filter: RowMatch) -> Self {
        self.filter.push(filter);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CostFormula {
    pub terms: Vec<CostTerm>,
    /// Keep the `Others` bucket in grids.
    pub include_others: bool,
    /// Keep cluster capacity no workload claimed.
    pub include_unallocated_cost: bool,
}

impl Default for CostFormula {
    /// Plain `SUM(cost)`, used when no preferences apply.
    fn default() -> Self {
        Self {
            terms: vec![CostTerm::add(columns::COST)],
            include_others: true,
            include_unallocated_cost: false,
        }
    }
}

/// Preferences after every layer has been applied; nothing is unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedPreferences {
    pub include_others: bool,
    pub include_unallocated_cost: bool,
    pub aws_include_discounts: bool,
    pub aws_include_credits: bool,
    pub aws_include_refunds: bool,
    pub aws_include_taxes: bool,
    pub aws_cost_basis: AwsCostBasis,
    pub gcp_include_discounts: bool,
    pub gcp_include_taxes: bool,
}

impl Default for ResolvedPreferences {
    fn default() -> Self {
        Self {
            include_others: true,
            include_unallocated_cost: false,
            aws_include_discounts: true,
            aws_include_credits: true,
            aws_include_refunds: true,
            aws_include_taxes: true,
            aws_cost_basis: AwsCostBasis::Unblended,
            gcp_include_discounts: true,
            gcp_include_taxes: true,
        }
    }
}

pub fn resolve(
    request: Option<&ViewPreferences>,
    view: Option<&CostView>,
    account: &AccountSettings,
) -> ResolvedPreferences {
    let mut merged = ViewPreferences::default();
    if let Some(view) = view {
        merged = merged.overlay(&view.preferences);
    }
    if let Some(request) = request {
        merged = merged.overlay(request);
    }

    let fallback = ResolvedPreferences::default();
    let flag = |value: Option<bool>, key: &str, default: bool| {
        value
            .or_else(|| account.get(key).and_then(|v| parse_bool(v)))
            .unwrap_or(default)
    };
    ResolvedPreferences {
        include_others: flag(merged.include_others, settings::INCLUDE_OTHERS, fallback.include_others),
        include_unallocated_cost: flag(
            merged.include_unallocated_cost,
            settings::INCLUDE_UNALLOCATED_COST,
            fallback.include_unallocated_cost,
        ),
        aws_include_discounts: flag(
            merged.aws.include_discounts,
            settings::INCLUDE_AWS_DISCOUNTS,
            fallback.aws_include_discounts,
        ),
        aws_include_credits: flag(
            merged.aws.include_credits,
            settings::INCLUDE_AWS_CREDITS,
            fallback.aws_include_credits,
        ),
        aws_include_refunds: flag(
            merged.aws.include_refunds,
            settings::INCLUDE_AWS_REFUNDS,
            fallback.aws_include_refunds,
        ),
        aws_include_taxes: flag(
            merged.aws.include_taxes,
            settings::INCLUDE_AWS_TAXES,
            fallback.aws_include_taxes,
        ),
        aws_cost_basis: merged
            .aws
            .cost_basis
            .or_else(|| {
                account
                    .get(settings::SHOW_AWS_COST_AS)
                    .and_then(|v| AwsCostBasis::parse(v))
            })
            .unwrap_or(fallback.aws_cost_basis),
        gcp_include_discounts: flag(
            merged.gcp.include_discounts,
            settings::INCLUDE_GCP_DISCOUNTS,
            fallback.gcp_include_discounts,
        ),
        gcp_include_taxes: flag(
            merged.gcp.include_taxes,
            settings::INCLUDE_GCP_TAXES,
            fallback.gcp_include_taxes,
        ),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

impl ResolvedPreferences {
    /// Ordered cost terms: non-AWS rows add `cost`, AWS rows add the chosen
    /// basis minus excluded line items, GCP rows adjust for discounts and tax.
    pub fn cost_formula(&self) -> CostFormula {
        let mut terms = vec![
            CostTerm::add(columns::COST)
                .filtered(RowMatch::not_in(columns::CLOUD_PROVIDER, &[CLOUD_PROVIDER_AWS])),
        ];

        let basis = self.aws_cost_basis.column();
        terms.push(
            CostTerm::add(basis)
                .filtered(RowMatch::is_in(columns::CLOUD_PROVIDER, &[CLOUD_PROVIDER_AWS])),
        );
        let mut excluded: Vec<&str> = Vec::new();
        for (include, types) in [
            (self.aws_include_discounts, AWS_DISCOUNT_TYPES),
            (self.aws_include_credits, AWS_CREDIT_TYPES),
            (self.aws_include_refunds, AWS_REFUND_TYPES),
            (self.aws_include_taxes, AWS_TAX_TYPES),
        ] {
            if !include {
                excluded.extend_from_slice(types);
            }
        }
        if !excluded.is_empty() {
            terms.push(
                CostTerm::subtract(basis)
                    .filtered(RowMatch::is_in(columns::CLOUD_PROVIDER, &[CLOUD_PROVIDER_AWS]))
                    .filtered(RowMatch::is_in(columns::AWS_LINE_ITEM_TYPE, &excluded)),
            );
        }

        if self.gcp_include_discounts {
            terms.push(
                CostTerm::add(columns::GCP_DISCOUNT)
                    .filtered(RowMatch::is_in(columns::CLOUD_PROVIDER, &[CLOUD_PROVIDER_GCP])),
            );
        }
        if !self.gcp_include_taxes {
            terms.push(
                CostTerm::subtract(columns::COST)
                    .filtered(RowMatch::is_in(columns::CLOUD_PROVIDER, &[CLOUD_PROVIDER_GCP]))
                    .filtered(RowMatch::is_in(columns::GCP_COST_TYPE, GCP_TAX_TYPES)),
            );
        }

        CostFormula {
            terms,
            include_others: self.include_others,
            include_unallocated_cost: self.include_unallocated_cost,
        }
    }
}
