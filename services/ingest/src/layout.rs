//! CSV row parser
//!
//! Each upload table has a fixed column layout. Records are reshaped to the
//! layout width and then converted into typed rows through the normalizer.
//!
//! Unquoted exports often carry commas inside the free-text column
//! (descriptions, indicator names). When a record is wider than its layout,
//! the fields before the free-text column are taken from the start, the
//! fields after it are counted back from the end of the line, and whatever
//! is left in between is re-joined as the free-text value.
//!
//! Some tables end with optional columns that older exports leave out. Those
//! columns only take part in the re-join when the file header names them.
//!
//! A record is dropped (`None`) when it has fewer than the layout's minimum
//! columns or a required numeric field does not parse.

use crate::source::SourceRecord;
use common::model::{
    ComponentLink, Dimension, IndicatorDefinition, IndicatorResult, RawDataLink, RawDatum,
    Subdimension, Table,
};
use common::normalize::{
    clamp_value, parse_date, parse_f64, parse_flag, parse_i64, parse_period, FieldLimits,
};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub columns: &'static [&'static str],
    /// Index of the column that absorbs overflow fields.
    pub free_text: Option<usize>,
    pub min_columns: usize,
    /// Trailing columns that may be missing from the export.
    pub optional_tail: usize,
}

impl Layout {
    pub fn width(&self) -> usize {
        self.columns.len()
    }

    /// Columns a file with `header_len` header cells actually carries.
    pub fn active_width(&self, header_len: usize) -> usize {
        if header_len >= self.width() {
            self.width()
        } else {
            self.width() - self.optional_tail
        }
    }

    #[cfg(test)]
    pub fn fit(&self, fields: Vec<String>, delimiter: char) -> Option<Vec<String>> {
        self.fit_to(fields, delimiter, self.active_width(0))
    }

    /// Reshape `fields` to exactly `width()` cells, re-joining overflow
    /// against the `active` columns the file carries, or `None` when the
    /// record is too short to be a row of this table. Columns past `active`
    /// are left empty.
    pub fn fit_to(&self, mut fields: Vec<String>, delimiter: char, active: usize) -> Option<Vec<String>> {
        let width = self.width();
        let active = active.min(width);
        if fields.len() < self.min_columns {
            return None;
        }

        if fields.len() > active {
            match self.free_text {
                Some(idx) if idx < active => {
                    let tail_len = active - idx - 1;
                    let tail_start = fields.len() - tail_len;
                    let tail = fields.split_off(tail_start);
                    let middle = fields.split_off(idx);
                    fields.push(middle.join(&delimiter.to_string()));
                    fields.extend(tail);
                }
                _ => fields.truncate(active),
            }
        }

        fields.resize(width, String::new());
        Some(fields)
    }
}

/// A table row that can be built from one CSV record.
pub trait FromRecord: Table {
    const LAYOUT: Layout;

    /// Build the row from exactly `LAYOUT.width()` fields.
    fn from_fields(fields: &[String], limits: &FieldLimits) -> Option<Self>;
}

pub fn parse_fields<T: FromRecord>(
    fields: Vec<String>,
    delimiter: char,
    active: usize,
    limits: &FieldLimits,
) -> Option<T> {
    let fields = T::LAYOUT.fit_to(fields, delimiter, active)?;
    T::from_fields(&fields, limits)
}

/// Parse a single delimited line (no header).
#[cfg(test)]
pub fn parse_line<T: FromRecord>(line: &str, delimiter: u8, limits: &FieldLimits) -> Option<T> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .from_reader(line.as_bytes());
    let record = reader.records().next()?.ok()?;
    parse_fields(
        record.iter().map(str::to_string).collect(),
        delimiter as char,
        T::LAYOUT.active_width(0),
        limits,
    )
}

/// Parse every record, returning the rows and the number skipped.
/// `header_len` is the number of header cells in the source file.
pub fn parse_records<T: FromRecord>(
    records: Vec<SourceRecord>,
    header_len: usize,
    delimiter: char,
    limits: &FieldLimits,
) -> (Vec<T>, usize) {
    let active = T::LAYOUT.active_width(header_len);
    let mut rows = Vec::with_capacity(records.len());
    let mut skipped = 0;
    for record in records {
        let width = record.fields.len();
        match parse_fields::<T>(record.fields, delimiter, active, limits) {
            Some(row) => rows.push(row),
            None => {
                debug!(table = T::NAME, line = record.line, fields = width, "Skipping row");
                skipped += 1;
            }
        }
    }
    (rows, skipped)
}

impl FromRecord for IndicatorDefinition {
    const LAYOUT: Layout = Layout {
        columns: &["id", "nombre", "id_subdimension", "formula", "importancia", "fuente"],
        free_text: Some(1),
        min_columns: 2,
        optional_tail: 0,
    };

    fn from_fields(f: &[String], limits: &FieldLimits) -> Option<Self> {
        Some(Self {
            id: parse_i64(&f[0])?,
            nombre: limits.text("nombre", &f[1]),
            id_subdimension: parse_i64(&f[2]),
            formula: limits.text("formula", &f[3]),
            importancia: limits.text("importancia", &f[4]),
            fuente: limits.text("fuente", &f[5]),
        })
    }
}

impl FromRecord for Dimension {
    const LAYOUT: Layout = Layout {
        columns: &["id", "nombre", "peso"],
        free_text: Some(1),
        min_columns: 2,
        optional_tail: 0,
    };

    fn from_fields(f: &[String], limits: &FieldLimits) -> Option<Self> {
        Some(Self {
            id: parse_i64(&f[0])?,
            nombre: limits.text("nombre", &f[1]),
            peso: parse_f64(&f[2]),
        })
    }
}

impl FromRecord for Subdimension {
    const LAYOUT: Layout = Layout {
        columns: &["id", "nombre", "peso", "id_dimension"],
        free_text: Some(1),
        min_columns: 2,
        optional_tail: 0,
    };

    fn from_fields(f: &[String], limits: &FieldLimits) -> Option<Self> {
        Some(Self {
            id: parse_i64(&f[0])?,
            nombre: limits.text("nombre", &f[1]),
            peso: parse_f64(&f[2]),
            id_dimension: parse_i64(&f[3]),
        })
    }
}

impl FromRecord for RawDatum {
    const LAYOUT: Layout = Layout {
        columns: &[
            "id",
            "id_indicador",
            "descripcion",
            "valor",
            "periodo",
            "pais",
            "provincia",
            "sector",
            "tamano_empresa",
            "procesado",
        ],
        free_text: Some(2),
        min_columns: 3,
        optional_tail: 1,
    };

    fn from_fields(f: &[String], limits: &FieldLimits) -> Option<Self> {
        Some(Self {
            id: parse_i64(&f[0])?,
            id_indicador: parse_i64(&f[1]),
            descripcion: limits.text("descripcion", &f[2]),
            valor: parse_f64(&f[3]),
            periodo: parse_period(&f[4]),
            pais: limits.text("pais", &f[5]),
            provincia: limits.text("provincia", &f[6]),
            sector: limits.text("sector", &f[7]),
            tamano_empresa: limits.text("tamano_empresa", &f[8]),
            procesado: parse_flag(&f[9]),
        })
    }
}

impl FromRecord for IndicatorResult {
    const LAYOUT: Layout = Layout {
        columns: &[
            "id",
            "valor_calculado",
            "fecha_calculo",
            "nombre_indicador",
            "periodo",
            "pais",
            "provincia",
            "sector",
        ],
        free_text: Some(3),
        min_columns: 2,
        optional_tail: 0,
    };

    fn from_fields(f: &[String], limits: &FieldLimits) -> Option<Self> {
        Some(Self {
            id: parse_i64(&f[0])?,
            valor_calculado: Some(clamp_value(parse_f64(&f[1])?)?),
            fecha_calculo: parse_date(&f[2]),
            nombre_indicador: limits.text("nombre_indicador", &f[3]),
            periodo: parse_period(&f[4]),
            pais: limits.text("pais", &f[5]),
            provincia: limits.text("provincia", &f[6]),
            sector: limits.text("sector", &f[7]),
        })
    }
}

impl FromRecord for ComponentLink {
    const LAYOUT: Layout = Layout {
        columns: &["id_componente", "id_resultado"],
        free_text: None,
        min_columns: 2,
        optional_tail: 0,
    };

    fn from_fields(f: &[String], _limits: &FieldLimits) -> Option<Self> {
        Some(Self {
            id_componente: parse_i64(&f[0])?,
            id_resultado: parse_i64(&f[1])?,
        })
    }
}

impl FromRecord for RawDataLink {
    const LAYOUT: Layout = Layout {
        columns: &["id_resultado", "id_dato_bruto"],
        free_text: None,
        min_columns: 2,
        optional_tail: 0,
    };

    fn from_fields(f: &[String], _limits: &FieldLimits) -> Option<Self> {
        Some(Self {
            id_resultado: parse_i64(&f[0])?,
            id_dato_bruto: parse_i64(&f[1])?,
        })
    }
}
