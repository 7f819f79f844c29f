//! Row types for the hosted store tables
//!
//! Column names follow the store schema. Every table carries its conflict
//! key (used for upserts), its default text limits and its upload batch size.

use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub trait Table: Serialize + DeserializeOwned + Clone + Send + Sync {
    const NAME: &'static str;
    const CONFLICT_KEY: &'static [&'static str];
    /// Maximum length, in characters, of each free-text column.
    const TEXT_LIMITS: &'static [(&'static str, usize)] = &[];
    const BATCH_SIZE: usize;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorDefinition {
    pub id: i64,
    pub nombre: Option<String>,
    pub id_subdimension: Option<i64>,
    pub formula: Option<String>,
    pub importancia: Option<String>,
    pub fuente: Option<String>,
}

impl Table for IndicatorDefinition {
    const NAME: &'static str = "definicion_indicadores";
    const CONFLICT_KEY: &'static [&'static str] = &["id"];
    const TEXT_LIMITS: &'static [(&'static str, usize)] = &[
        ("nombre", 100),
        ("formula", 20),
        ("importancia", 20),
        ("fuente", 200),
    ];
    const BATCH_SIZE: usize = 100;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dimension {
    pub id: i64,
    pub nombre: Option<String>,
    pub peso: Option<f64>,
}

impl Table for Dimension {
    const NAME: &'static str = "dimensiones";
    const CONFLICT_KEY: &'static [&'static str] = &["id"];
    const TEXT_LIMITS: &'static [(&'static str, usize)] = &[("nombre", 100)];
    const BATCH_SIZE: usize = 50;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subdimension {
    pub id: i64,
    pub nombre: Option<String>,
    pub peso: Option<f64>,
    pub id_dimension: Option<i64>,
}

impl Table for Subdimension {
    const NAME: &'static str = "subdimensiones";
    const CONFLICT_KEY: &'static [&'static str] = &["id"];
    const TEXT_LIMITS: &'static [(&'static str, usize)] = &[("nombre", 100)];
    const BATCH_SIZE: usize = 50;
}

/// A raw observation. `valor` is numeric or null; `periodo` is 0 when the
/// source year could not be parsed. `procesado` is left out of writes when
/// the export does not carry it, so the stored flag survives re-uploads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDatum {
    pub id: i64,
    pub id_indicador: Option<i64>,
    pub descripcion: Option<String>,
    pub valor: Option<f64>,
    pub periodo: i32,
    pub pais: Option<String>,
    pub provincia: Option<String>,
    pub sector: Option<String>,
    pub tamano_empresa: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub procesado: Option<bool>,
}

impl Table for RawDatum {
    const NAME: &'static str = "datos_brutos";
    const CONFLICT_KEY: &'static [&'static str] = &["id"];
    const TEXT_LIMITS: &'static [(&'static str, usize)] = &[
        ("descripcion", 300),
        ("pais", 100),
        ("provincia", 100),
        ("sector", 200),
        ("tamano_empresa", 50),
    ];
    const BATCH_SIZE: usize = 500;
}

/// A computed indicator value. `valor_calculado` always passes through the
/// numeric safety clamp before it is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorResult {
    pub id: i64,
    pub valor_calculado: Option<f64>,
    pub fecha_calculo: Option<NaiveDate>,
    pub nombre_indicador: Option<String>,
    pub periodo: i32,
    pub pais: Option<String>,
    pub provincia: Option<String>,
    pub sector: Option<String>,
}

impl Table for IndicatorResult {
    const NAME: &'static str = "resultado_indicadores";
    const CONFLICT_KEY: &'static [&'static str] = &["id"];
    const TEXT_LIMITS: &'static [(&'static str, usize)] = &[
        ("nombre_indicador", 100),
        ("pais", 100),
        ("provincia", 100),
        ("sector", 200),
    ];
    const BATCH_SIZE: usize = 500;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorComponent {
    pub id: i64,
    pub id_indicador: Option<i64>,
    #[serde(default)]
    pub nombre: Option<String>,
}

impl Table for IndicatorComponent {
    const NAME: &'static str = "componentes_indicador";
    const CONFLICT_KEY: &'static [&'static str] = &["id"];
    const TEXT_LIMITS: &'static [(&'static str, usize)] = &[("nombre", 100)];
    const BATCH_SIZE: usize = 100;
}

/// Lineage link between a result and one of its components.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComponentLink {
    pub id_componente: i64,
    pub id_resultado: i64,
}

impl Table for ComponentLink {
    const NAME: &'static str = "componente_resultado";
    const CONFLICT_KEY: &'static [&'static str] = &["id_componente", "id_resultado"];
    const BATCH_SIZE: usize = 500;
}

/// Lineage link between a result and a raw datum it was computed from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RawDataLink {
    pub id_resultado: i64,
    pub id_dato_bruto: i64,
}

impl Table for RawDataLink {
    const NAME: &'static str = "resultado_datos_brutos";
    const CONFLICT_KEY: &'static [&'static str] = &["id_resultado", "id_dato_bruto"];
    const BATCH_SIZE: usize = 500;
}

/// Tables counted on the dashboard, with the label shown for each.
pub const COUNTED_TABLES: &[(&str, &str)] = &[
    ("indicadores", IndicatorDefinition::NAME),
    ("dimensiones", Dimension::NAME),
    ("subdimensiones", Subdimension::NAME),
    ("datos_brutos", RawDatum::NAME),
    ("resultados", IndicatorResult::NAME),
];
