//! Text-protocol result set decoding

use super::connection::ConnectionError;

/// Decode a length-encoded integer, returning the value and bytes consumed.
/// `None` for the NULL marker (0xFB) or a truncated buffer.
pub fn read_lenenc_int(data: &[u8]) -> Option<(u64, usize)> {
    let first = *data.first()?;
    match first {
        0..=0xFA => Some((first as u64, 1)),
        0xFC if data.len() >= 3 => Some((u16::from_le_bytes([data[1], data[2]]) as u64, 3)),
        0xFD if data.len() >= 4 => Some((
            u32::from_le_bytes([data[1], data[2], data[3], 0]) as u64,
            4,
        )),
        0xFE if data.len() >= 9 => {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&data[1..9]);
            Some((u64::from_le_bytes(bytes), 9))
        }
        _ => None,
    }
}

/// Decode a length-encoded string; `Ok((None, 1))` for SQL NULL
pub fn read_lenenc_str(data: &[u8]) -> Result<(Option<String>, usize), ConnectionError> {
    if data.first() == Some(&0xFB) {
        return Ok((None, 1));
    }
    let (len, header) = read_lenenc_int(data)
        .ok_or_else(|| ConnectionError::Protocol("invalid length-encoded string".into()))?;
    let end = header + len as usize;
    if data.len() < end {
        return Err(ConnectionError::Protocol("truncated length-encoded string".into()));
    }
    Ok((
        Some(String::from_utf8_lossy(&data[header..end]).to_string()),
        end,
    ))
}

/// Column name from a column definition packet (5th length-encoded field)
pub fn column_name(payload: &[u8]) -> Result<String, ConnectionError> {
    let mut offset = 0;
    let mut name = None;
    // catalog, schema, table, org_table, name
    for _ in 0..5 {
        let (value, used) = read_lenenc_str(&payload[offset..])?;
        offset += used;
        name = value;
    }
    Ok(name.unwrap_or_default())
}

/// Decode one text row with `columns` fields
pub fn parse_row(payload: &[u8], columns: usize) -> Result<Vec<Option<String>>, ConnectionError> {
    let mut offset = 0;
    let mut values = Vec::with_capacity(columns);
    for _ in 0..columns {
        let (value, used) = read_lenenc_str(&payload[offset..])?;
        offset += used;
        values.push(value);
    }
    Ok(values)
}

/// Fully buffered result of a text query
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl ResultSet {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Option<String>>>) -> Self {
        Self { columns, rows }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> impl Iterator<Item = Row<'_>> {
        self.rows.iter().map(move |values| Row {
            columns: &self.columns,
            values,
        })
    }

    pub fn first(&self) -> Option<Row<'_>> {
        self.rows().next()
    }
}

/// Borrowed view over one row with case-insensitive column lookup
#[derive(Debug, Clone, Copy)]
pub struct Row<'a> {
    columns: &'a [String],
    values: &'a [Option<String>],
}

impl<'a> Row<'a> {
    pub fn get(&self, column: &str) -> Option<&'a str> {
        let idx = self
            .columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))?;
        self.values.get(idx)?.as_deref()
    }

    pub fn get_index(&self, idx: usize) -> Option<&'a str> {
        self.values.get(idx)?.as_deref()
    }

    pub fn get_u64(&self, column: &str) -> Option<u64> {
        self.get(column)?.trim().parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lenenc(s: &str) -> Vec<u8> {
        let mut out = vec![s.len() as u8];
        out.extend_from_slice(s.as_bytes());
        out
    }

    #[test]
    fn test_read_lenenc_int() {
        assert_eq!(read_lenenc_int(&[0x05]), Some((5, 1)));
        assert_eq!(read_lenenc_int(&[0xFC, 0x10, 0x27]), Some((10_000, 3)));
        assert_eq!(read_lenenc_int(&[0xFD, 0x01, 0x00, 0x01]), Some((65_537, 4)));
        assert_eq!(read_lenenc_int(&[0xFC, 0x10]), None);
        assert_eq!(read_lenenc_int(&[]), None);
    }

    #[test]
    fn test_parse_row_with_null() {
        let mut payload = lenenc("TDBCTL0");
        payload.push(0xFB);
        payload.extend(lenenc("26000"));
        let row = parse_row(&payload, 3).unwrap();
        assert_eq!(
            row,
            vec![Some("TDBCTL0".to_string()), None, Some("26000".to_string())]
        );
    }

    #[test]
    fn test_parse_row_truncated() {
        let payload = vec![0x09, b'a', b'b'];
        assert!(parse_row(&payload, 1).is_err());
    }

    #[test]
    fn test_column_name() {
        let mut payload = Vec::new();
        for part in ["def", "mysql", "servers", "servers", "Server_name", "Server_name"] {
            payload.extend(lenenc(part));
        }
        assert_eq!(column_name(&payload).unwrap(), "Server_name");
    }

    #[test]
    fn test_row_lookup_is_case_insensitive() {
        let rs = ResultSet::new(
            vec!["Relay_Log_File".into(), "Exec_Master_Log_Pos".into()],
            vec![vec![Some("relay.000012".into()), Some("4521".into())]],
        );
        let row = rs.first().unwrap();
        assert_eq!(row.get("relay_log_file"), Some("relay.000012"));
        assert_eq!(row.get_u64("EXEC_MASTER_LOG_POS"), Some(4521));
        assert_eq!(row.get("missing"), None);
    }
}
