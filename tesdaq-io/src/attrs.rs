//! Typed HDF5 attribute helpers.
//!
//! Bridges [`MetadataValue`] and HDF5 attributes at any container level.
//! Values are written with their native type; a value the container cannot
//! hold natively is coerced to its string form with a warning rather than
//! failing the write.

use crate::{Error, Result};
use hdf5::types::{H5Type, TypeDescriptor, VarLenAscii, VarLenUnicode};
use hdf5::{Attribute, Location};
use log::{debug, warn};
use ndarray::ArrayView1;
use std::str::FromStr;
use tesdaq_core::{MetadataMap, MetadataValue};

/// Writes one attribute with its native type.
///
/// # Errors
/// Returns an error if the attribute cannot be created even in coerced
/// string form.
pub fn write_attr(loc: &Location, name: &str, value: &MetadataValue) -> Result<()> {
    let written = match value {
        MetadataValue::Int(v) => write_scalar(loc, name, v),
        MetadataValue::Float(v) => write_scalar(loc, name, v),
        MetadataValue::Str(v) => write_str_scalar(loc, name, v),
        MetadataValue::IntArray(v) => write_array(loc, name, v),
        MetadataValue::FloatArray(v) => write_array(loc, name, v),
        MetadataValue::StrArray(v) => write_str_array(loc, name, v),
    };
    match written {
        Ok(()) => Ok(()),
        Err(err) => {
            // Best-effort coercion: store the string form instead of failing.
            warn!("attribute {name:?} not storable natively ({err}); coercing to string");
            write_str_scalar(loc, name, &value.coerce_str())
        }
    }
}

/// Writes every attribute of a map.
///
/// # Errors
/// Returns an error on the first attribute that cannot be written.
pub fn write_attrs(loc: &Location, attrs: &MetadataMap) -> Result<()> {
    for (name, value) in attrs.iter() {
        write_attr(loc, name, value)?;
    }
    Ok(())
}

/// Overwrites an existing scalar integer attribute in place.
///
/// # Errors
/// Returns an error if the attribute does not exist or cannot be written.
pub fn update_int_attr(loc: &Location, name: &str, value: i64) -> Result<()> {
    loc.attr(name)?.write_scalar(&value)?;
    Ok(())
}

/// Reads every attribute of a location into a map.
///
/// Attributes with types the metadata model cannot represent are skipped.
///
/// # Errors
/// Returns an error if the attribute list itself cannot be enumerated.
pub fn read_attrs(loc: &Location) -> Result<MetadataMap> {
    let mut map = MetadataMap::new();
    for name in loc.attr_names()? {
        let attr = loc.attr(&name)?;
        match read_attr_value(&attr) {
            Ok(value) => map.insert(name, value),
            Err(err) => debug!("skipping attribute {name:?}: {err}"),
        }
    }
    Ok(map)
}

/// Reads one attribute into a tagged value.
///
/// # Errors
/// Returns an error for attribute types outside the metadata model.
pub fn read_attr_value(attr: &Attribute) -> Result<MetadataValue> {
    let descriptor = attr.dtype()?.to_descriptor()?;
    let is_array = !attr.shape().is_empty();
    let value = match descriptor {
        TypeDescriptor::Integer(_) | TypeDescriptor::Unsigned(_) => {
            if is_array {
                MetadataValue::IntArray(attr.read_raw::<i64>()?)
            } else {
                MetadataValue::Int(attr.read_scalar::<i64>()?)
            }
        }
        TypeDescriptor::Boolean => {
            if is_array {
                let values = attr.read_raw::<bool>()?;
                MetadataValue::IntArray(values.iter().map(|&b| i64::from(b)).collect())
            } else {
                MetadataValue::Int(i64::from(attr.read_scalar::<bool>()?))
            }
        }
        TypeDescriptor::Float(_) => {
            if is_array {
                MetadataValue::FloatArray(attr.read_raw::<f64>()?)
            } else {
                MetadataValue::Float(attr.read_scalar::<f64>()?)
            }
        }
        TypeDescriptor::VarLenUnicode => {
            if is_array {
                let values = attr.read_raw::<VarLenUnicode>()?;
                MetadataValue::StrArray(values.iter().map(ToString::to_string).collect())
            } else {
                MetadataValue::Str(attr.read_scalar::<VarLenUnicode>()?.to_string())
            }
        }
        TypeDescriptor::VarLenAscii => {
            if is_array {
                let values = attr.read_raw::<VarLenAscii>()?;
                MetadataValue::StrArray(values.iter().map(ToString::to_string).collect())
            } else {
                MetadataValue::Str(attr.read_scalar::<VarLenAscii>()?.to_string())
            }
        }
        other => {
            return Err(Error::InvalidFormat(format!(
                "unsupported attribute type {other:?}"
            )))
        }
    };
    Ok(value)
}

fn write_scalar<T: H5Type>(loc: &Location, name: &str, value: &T) -> Result<()> {
    loc.new_attr::<T>().create(name)?.write_scalar(value)?;
    Ok(())
}

fn write_array<T: H5Type>(loc: &Location, name: &str, values: &[T]) -> Result<()> {
    let attr = loc.new_attr::<T>().shape((values.len(),)).create(name)?;
    attr.write(ArrayView1::from(values))?;
    Ok(())
}

fn write_str_scalar(loc: &Location, name: &str, value: &str) -> Result<()> {
    let value = to_var_len_unicode(value)?;
    loc.new_attr::<VarLenUnicode>()
        .create(name)?
        .write_scalar(&value)?;
    Ok(())
}

fn write_str_array(loc: &Location, name: &str, values: &[String]) -> Result<()> {
    let values: Vec<VarLenUnicode> = values
        .iter()
        .map(|v| to_var_len_unicode(v))
        .collect::<Result<Vec<_>>>()?;
    let attr = loc
        .new_attr::<VarLenUnicode>()
        .shape((values.len(),))
        .create(name)?;
    attr.write(ArrayView1::from(values.as_slice()))?;
    Ok(())
}

fn to_var_len_unicode(value: &str) -> Result<VarLenUnicode> {
    VarLenUnicode::from_str(value)
        .map_err(|e| Error::InvalidFormat(format!("invalid utf-8 attribute: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_attr_map_roundtrip() {
        let file = NamedTempFile::new().unwrap();
        let file = hdf5::File::create(file.path()).unwrap();
        let group = file.create_group("adc1").unwrap();

        let mut attrs = MetadataMap::new();
        attrs.insert("sample_rate", 1_250_000.0);
        attrs.insert("nb_samples", 4096i64);
        attrs.insert("comment", "noise run");
        attrs.insert("adc_conversion_factor0", vec![2.0, 0.5, 0.0]);
        attrs.insert(
            "connection0",
            MetadataValue::StrArray(vec!["tes:A".to_string(), "detector:Det1".to_string()]),
        );

        write_attrs(&group, &attrs).unwrap();
        let read = read_attrs(&group).unwrap();
        assert_eq!(read, attrs);
    }

    #[test]
    fn test_update_int_attr_in_place() {
        let file = NamedTempFile::new().unwrap();
        let file = hdf5::File::create(file.path()).unwrap();
        let group = file.create_group("adc1").unwrap();

        write_attr(&group, "nb_events", &MetadataValue::Int(0)).unwrap();
        update_int_attr(&group, "nb_events", 7).unwrap();
        let read = read_attrs(&group).unwrap();
        assert_eq!(read.require_int("nb_events").unwrap(), 7);
    }
}
