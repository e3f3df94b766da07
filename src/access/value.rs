use anyhow::{bail, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::{Cursor, Read};

/// Column types supported by the store
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Int = 1,
    Long = 2,
    Varchar = 3,
    Bytes = 4,
}

impl DataType {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(DataType::Int),
            2 => Ok(DataType::Long),
            3 => Ok(DataType::Varchar),
            4 => Ok(DataType::Bytes),
            _ => bail!("Unknown data type: {}", value),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Int => "INT",
            DataType::Long => "LONG",
            DataType::Varchar => "STRING",
            DataType::Bytes => "BYTES",
        };
        f.write_str(name)
    }
}

/// A single column value.
///
/// Values of the same type order naturally; across types the variant order applies,
/// with `Null` first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Value {
    Null,
    Int(i32),
    Long(i64),
    Str(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Value::Null => None,
            Value::Int(_) => Some(DataType::Int),
            Value::Long(_) => Some(DataType::Long),
            Value::Str(_) => Some(DataType::Varchar),
            Value::Bytes(_) => Some(DataType::Bytes),
        }
    }

    /// NULL is compatible with every type; nullability is checked by the schema.
    pub fn is_compatible_with(&self, data_type: DataType) -> bool {
        match self.data_type() {
            None => true,
            Some(own) => own == data_type,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Int(v) => write!(f, "{}", v),
            Value::Long(v) => write!(f, "{}", v),
            Value::Str(v) => f.write_str(v),
            Value::Bytes(v) => {
                f.write_str("0x")?;
                for b in v {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Long(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

/// A row is one value per schema column, primary key first.
pub type Row = Vec<Value>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Table layout. Column 0 is the primary key and is never nullable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    table_name: String,
    columns: Vec<Column>,
}

impl Schema {
    pub fn new(table_name: impl Into<String>, mut columns: Vec<Column>) -> Result<Self> {
        let Some(key) = columns.first_mut() else {
            bail!("A schema needs at least one column");
        };
        key.nullable = false;
        Ok(Self {
            table_name: table_name.into(),
            columns,
        })
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn key_column(&self) -> &Column {
        &self.columns[0]
    }

    pub fn data_types(&self) -> Vec<DataType> {
        self.columns.iter().map(|c| c.data_type).collect()
    }

    /// Checks arity, types and nullability.
    pub fn validate(&self, row: &[Value]) -> Result<()> {
        if row.len() != self.columns.len() {
            bail!(
                "Row has {} values but table {} has {} columns",
                row.len(),
                self.table_name,
                self.columns.len()
            );
        }
        for (value, column) in row.iter().zip(&self.columns) {
            if value.is_null() && !column.nullable {
                bail!("Column {} cannot be NULL", column.name);
            }
            if !value.is_compatible_with(column.data_type) {
                bail!(
                    "Value {:?} is not compatible with column {} of type {}",
                    value,
                    column.name,
                    column.data_type
                );
            }
        }
        Ok(())
    }

    pub fn encode_row(&self, row: &[Value]) -> Result<Vec<u8>> {
        self.validate(row)?;
        serialize_values(row, &self.data_types())
    }

    pub fn decode_row(&self, data: &[u8]) -> Result<Row> {
        deserialize_values(data, &self.data_types())
    }

    /// Primary key of an encoded row, decoding only as much as needed.
    pub fn key_of_encoded(&self, data: &[u8]) -> Result<Value> {
        let mut row = self.decode_row(data)?;
        Ok(row.swap_remove(0))
    }
}

/// Serialize values according to schema: NULL bitmap, then big-endian fields.
pub fn serialize_values(values: &[Value], schema: &[DataType]) -> Result<Vec<u8>> {
    if values.len() != schema.len() {
        bail!(
            "Value count {} doesn't match schema length {}",
            values.len(),
            schema.len()
        );
    }

    let mut data = Vec::new();

    // NULL bitmap (1 bit per column, rounded up to bytes)
    let mut null_bitmap = vec![0u8; schema.len().div_ceil(8)];
    for (i, (value, expected_type)) in values.iter().zip(schema).enumerate() {
        if value.is_null() {
            null_bitmap[i / 8] |= 1 << (i % 8);
        } else if !value.is_compatible_with(*expected_type) {
            bail!(
                "Value {:?} is not compatible with type {}",
                value,
                expected_type
            );
        }
    }
    data.extend_from_slice(&null_bitmap);

    for value in values {
        match value {
            Value::Null => {}
            Value::Int(v) => data.write_i32::<BigEndian>(*v)?,
            Value::Long(v) => data.write_i64::<BigEndian>(*v)?,
            Value::Str(s) => write_var(&mut data, s.as_bytes())?,
            Value::Bytes(b) => write_var(&mut data, b)?,
        }
    }

    Ok(data)
}

fn write_var(data: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
    data.write_i32::<BigEndian>(bytes.len() as i32)?;
    data.extend_from_slice(bytes);
    Ok(())
}

/// Deserialize bytes according to schema
pub fn deserialize_values(data: &[u8], schema: &[DataType]) -> Result<Vec<Value>> {
    let null_bitmap_size = schema.len().div_ceil(8);
    if data.len() < null_bitmap_size {
        bail!("Data too short for NULL bitmap");
    }

    let null_bitmap = &data[..null_bitmap_size];
    let mut cursor = Cursor::new(&data[null_bitmap_size..]);
    let mut values = Vec::with_capacity(schema.len());

    for (i, data_type) in schema.iter().enumerate() {
        if null_bitmap[i / 8] & (1 << (i % 8)) != 0 {
            values.push(Value::Null);
            continue;
        }
        let value = match data_type {
            DataType::Int => Value::Int(cursor.read_i32::<BigEndian>()?),
            DataType::Long => Value::Long(cursor.read_i64::<BigEndian>()?),
            DataType::Varchar => Value::Str(String::from_utf8(read_var(&mut cursor)?)?),
            DataType::Bytes => Value::Bytes(read_var(&mut cursor)?),
        };
        values.push(value);
    }

    if cursor.position() as usize != cursor.get_ref().len() {
        bail!("Trailing bytes after row");
    }
    Ok(values)
}

fn read_var(cursor: &mut Cursor<&[u8]>) -> Result<Vec<u8>> {
    let len = cursor.read_i32::<BigEndian>()?;
    let remaining = cursor.get_ref().len() - cursor.position() as usize;
    if len < 0 || len as usize > remaining {
        bail!("Invalid field length {}", len);
    }
    let mut buf = vec![0u8; len as usize];
    cursor.read_exact(&mut buf)?;
    Ok(buf)
}
