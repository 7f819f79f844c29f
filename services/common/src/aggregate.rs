//! Dashboard aggregation over stored indicator results
//!
//! Everything here is a pure function over rows already fetched from the
//! store, so the API (which reads Postgres directly) and the verifier (which
//! falls back to the REST store) compute identical statistics.
//!
//! Tie-breaking: the most recent period wins; within a period an exact
//! country-name match beats an alternate spelling of the same country.

use crate::model::IndicatorResult;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

/// Alternate spellings accepted for a country, compared after folding.
const COUNTRY_ALIASES: &[&[&str]] = &[
    &["espana", "spain", "es", "reino de espana"],
    &["francia", "france", "fr"],
    &["alemania", "germany", "deutschland", "de"],
    &["italia", "italy", "it"],
    &["portugal", "pt"],
    &["reino unido", "united kingdom", "uk", "gb"],
    &["estados unidos", "united states", "eeuu", "usa", "us"],
    &["union europea", "european union", "ue", "eu", "ue-27", "eu27"],
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CountryMatch {
    None,
    Alias,
    Exact,
}

/// Lowercase, trim and strip Spanish diacritics.
pub fn fold(s: &str) -> String {
    s.trim()
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'á' | 'à' | 'ä' | 'â' => 'a',
            'é' | 'è' | 'ë' | 'ê' => 'e',
            'í' | 'ì' | 'ï' | 'î' => 'i',
            'ó' | 'ò' | 'ö' | 'ô' => 'o',
            'ú' | 'ù' | 'ü' | 'û' => 'u',
            'ñ' => 'n',
            'ç' => 'c',
            other => other,
        })
        .collect()
}

fn alias_group(folded: &str) -> Option<usize> {
    COUNTRY_ALIASES
        .iter()
        .position(|group| group.contains(&folded))
}

pub fn match_country(candidate: Option<&str>, wanted: &str) -> CountryMatch {
    let Some(candidate) = candidate else {
        return CountryMatch::None;
    };
    if candidate.trim() == wanted.trim() {
        return CountryMatch::Exact;
    }
    let (a, b) = (fold(candidate), fold(wanted));
    if a == b {
        return CountryMatch::Alias;
    }
    match (alias_group(&a), alias_group(&b)) {
        (Some(x), Some(y)) if x == y => CountryMatch::Alias,
        _ => CountryMatch::None,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TerritoryFilter {
    pub pais: Option<String>,
    pub provincia: Option<String>,
    pub sector: Option<String>,
    pub periodo: Option<i32>,
}

impl TerritoryFilter {
    /// Match quality of `row`, `None` when the row is filtered out. Rows are
    /// `Exact` when no country was asked for.
    pub fn quality(&self, row: &IndicatorResult) -> Option<CountryMatch> {
        if let Some(periodo) = self.periodo {
            if row.periodo != periodo {
                return None;
            }
        }
        if let Some(provincia) = &self.provincia {
            if fold(row.provincia.as_deref().unwrap_or("")) != fold(provincia) {
                return None;
            }
        }
        if let Some(sector) = &self.sector {
            if fold(row.sector.as_deref().unwrap_or("")) != fold(sector) {
                return None;
            }
        }
        match &self.pais {
            None => Some(CountryMatch::Exact),
            Some(pais) => match match_country(row.pais.as_deref(), pais) {
                CountryMatch::None => None,
                quality => Some(quality),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestValue {
    pub indicador: String,
    pub valor: f64,
    pub periodo: i32,
    pub pais: Option<String>,
    pub country_match: CountryMatch,
    pub result_id: i64,
}

/// Per indicator name, the value of the most recent period. Names are
/// grouped case- and accent-insensitively and reported with the first
/// spelling seen. Rows without a name or a value are ignored. Output is
/// sorted by folded indicator name.
pub fn latest_by_indicator(rows: &[IndicatorResult], filter: &TerritoryFilter) -> Vec<LatestValue> {
    let mut best: BTreeMap<String, (&str, &IndicatorResult, CountryMatch)> = BTreeMap::new();

    for row in rows {
        let (Some(name), Some(_)) = (row.nombre_indicador.as_deref(), row.valor_calculado) else {
            continue;
        };
        let Some(quality) = filter.quality(row) else {
            continue;
        };
        let rank = |r: &IndicatorResult, q: CountryMatch| (r.periodo, q, Reverse(r.id));
        match best.entry(fold(name)) {
            Entry::Vacant(slot) => {
                slot.insert((name, row, quality));
            }
            Entry::Occupied(mut slot) => {
                let (spelling, current, current_q) = *slot.get();
                if rank(current, current_q) < rank(row, quality) {
                    slot.insert((spelling, row, quality));
                }
            }
        }
    }

    best.into_values()
        .filter_map(|(name, row, quality)| {
            Some(LatestValue {
                indicador: name.to_string(),
                valor: row.valor_calculado?,
                periodo: row.periodo,
                pais: row.pais.clone(),
                country_match: quality,
                result_id: row.id,
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerritoryAverage {
    pub average: f64,
    pub count: usize,
    pub country_match: CountryMatch,
    /// True when the percentage heuristic divided the raw average by 100.
    pub rescaled: bool,
}

/// Average value of the rows matching `filter` (optionally for a single
/// indicator). When some rows match the country exactly, alternate
/// spellings are left out.
///
/// `assume_percent` enables the legacy heuristic that treats an average
/// above 100 as an unnormalized percentage and divides it by 100. It is off
/// unless a caller asks for it.
pub fn territory_average(
    rows: &[IndicatorResult],
    indicador: Option<&str>,
    filter: &TerritoryFilter,
    assume_percent: bool,
) -> Option<TerritoryAverage> {
    let matched: Vec<(f64, CountryMatch)> = rows
        .iter()
        .filter(|row| match indicador {
            Some(name) => row.nombre_indicador.as_deref().map(fold) == Some(fold(name)),
            None => true,
        })
        .filter_map(|row| Some((row.valor_calculado?, filter.quality(row)?)))
        .collect();

    let best = matched.iter().map(|(_, q)| *q).max()?;
    let values: Vec<f64> = matched
        .iter()
        .filter(|(_, q)| *q == best)
        .map(|(v, _)| *v)
        .collect();

    let raw = values.iter().sum::<f64>() / values.len() as f64;
    let rescaled = assume_percent && raw > 100.0;
    Some(TerritoryAverage {
        average: if rescaled { raw / 100.0 } else { raw },
        count: values.len(),
        country_match: best,
        rescaled,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendPoint {
    pub periodo: i32,
    pub valor: f64,
    pub count: usize,
}

/// One point per period (ascending) for `indicador`: the mean of the
/// best-matching rows of that period. Period 0 means "unknown" and is
/// skipped.
pub fn trend(rows: &[IndicatorResult], indicador: &str, filter: &TerritoryFilter) -> Vec<TrendPoint> {
    let wanted = fold(indicador);
    let mut by_period: BTreeMap<i32, (CountryMatch, Vec<f64>)> = BTreeMap::new();

    for row in rows {
        if row.periodo == 0 || row.nombre_indicador.as_deref().map(fold) != Some(wanted.clone()) {
            continue;
        }
        let (Some(valor), Some(quality)) = (row.valor_calculado, filter.quality(row)) else {
            continue;
        };
        let entry = by_period
            .entry(row.periodo)
            .or_insert((quality, Vec::new()));
        if quality > entry.0 {
            *entry = (quality, vec![valor]);
        } else if quality == entry.0 {
            entry.1.push(valor);
        }
    }

    by_period
        .into_iter()
        .map(|(periodo, (_, values))| TrendPoint {
            periodo,
            valor: values.iter().sum::<f64>() / values.len() as f64,
            count: values.len(),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiSummary {
    pub indicators_with_data: usize,
    pub latest_period: Option<i32>,
    pub latest_average: Option<f64>,
    pub previous_period: Option<i32>,
    pub previous_average: Option<f64>,
    pub change_pct: Option<f64>,
}

fn mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

/// Headline numbers: how many indicators have data, and the mean of their
/// latest values in the most recent period versus the period before.
pub fn kpi_summary(rows: &[IndicatorResult], filter: &TerritoryFilter) -> KpiSummary {
    let latest = latest_by_indicator(rows, filter);
    let periods: BTreeSet<i32> = latest.iter().map(|v| v.periodo).filter(|p| *p > 0).collect();
    let latest_period = periods.iter().next_back().copied();
    let previous_period = latest_period.map(|p| p - 1);

    let average_for = |periodo: Option<i32>| -> Option<f64> {
        let periodo = periodo?;
        let scoped = TerritoryFilter {
            periodo: Some(periodo),
            ..filter.clone()
        };
        let values: Vec<f64> = latest_by_indicator(rows, &scoped)
            .into_iter()
            .map(|v| v.valor)
            .collect();
        mean(&values)
    };

    let latest_average = average_for(latest_period);
    let previous_average = average_for(previous_period);
    let change_pct = match (latest_average, previous_average) {
        (Some(now), Some(before)) if before != 0.0 => Some((now - before) / before.abs() * 100.0),
        _ => None,
    };

    KpiSummary {
        indicators_with_data: latest.len(),
        latest_period,
        latest_average,
        previous_period: previous_average.and(previous_period),
        previous_average,
        change_pct,
    }
}

/// What a report can be built from: which indicators, periods and countries
/// have stored results, plus row counts per table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub indicators: Vec<String>,
    pub periods: Vec<i32>,
    pub countries: Vec<String>,
    pub counts: BTreeMap<String, u64>,
}

pub fn report_metadata(rows: &[IndicatorResult], counts: BTreeMap<String, u64>) -> ReportMetadata {
    let with_value = rows.iter().filter(|r| r.valor_calculado.is_some());
    let mut indicators = BTreeSet::new();
    let mut periods = BTreeSet::new();
    let mut countries = BTreeSet::new();
    for row in with_value {
        if let Some(name) = &row.nombre_indicador {
            indicators.insert(name.clone());
        }
        if row.periodo > 0 {
            periods.insert(row.periodo);
        }
        if let Some(pais) = &row.pais {
            countries.insert(pais.clone());
        }
    }
    ReportMetadata {
        indicators: indicators.into_iter().collect(),
        periods: periods.into_iter().collect(),
        countries: countries.into_iter().collect(),
        counts,
    }
}
