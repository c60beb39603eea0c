//! Text-header grammar for the tabular extension payloads. The bodies
//! themselves (CSV rows, raw array bytes) are the caller's business; these
//! helpers only enforce the wire contract for ext codes 1 and 3.

use tether_std::errors::RemoteError;

/// `#type:ndarray\n#shape:2,3\n#dtype:float64\n` + raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NdarrayHeader {
    pub shape: Vec<usize>,
    pub dtype: String,
}

/// `#type:dataframe\n#dtype:a,int64,b,float64\n#index:index\n` + CSV.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataframeHeader {
    pub dtype: String,
    pub index: String,
}

impl DataframeHeader {
    /// Alternating `name,dtype` pairs; a single token means one dtype for
    /// every column.
    pub fn dtype_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        let mut fields = self.dtype.split(',');
        std::iter::from_fn(move || {
            let name = fields.next()?;
            let dtype = fields.next()?;
            Some((name, dtype))
        })
    }
}

pub fn encode_ndarray(header: &NdarrayHeader, body: &[u8]) -> Vec<u8> {
    let shape = header
        .shape
        .iter()
        .map(usize::to_string)
        .collect::<Vec<_>>()
        .join(",");
    let mut out = format!("#type:ndarray\n#shape:{}\n#dtype:{}\n", shape, header.dtype).into_bytes();
    out.extend_from_slice(body);
    out
}

pub fn decode_ndarray(data: &[u8]) -> Result<(NdarrayHeader, &[u8]), RemoteError> {
    let (kind, rest) = read_field(data, "#type:")?;
    if kind != "ndarray" {
        return Err(RemoteError::PackUnpack(format!(
            "invalid type string: {kind}"
        )));
    }
    let (shape, rest) = read_field(rest, "#shape:")?;
    let (dtype, body) = read_field(rest, "#dtype:")?;

    let shape = shape
        .split(',')
        .map(|part| {
            part.parse::<usize>()
                .map_err(|_| RemoteError::PackUnpack(format!("invalid shape: {shape}")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok((NdarrayHeader { shape, dtype }, body))
}

pub fn encode_dataframe(header: &DataframeHeader, csv: &[u8]) -> Vec<u8> {
    let mut out = format!(
        "#type:dataframe\n#dtype:{}\n#index:{}\n",
        header.dtype, header.index
    )
    .into_bytes();
    out.extend_from_slice(csv);
    out
}

pub fn decode_dataframe(data: &[u8]) -> Result<(DataframeHeader, &[u8]), RemoteError> {
    let (kind, rest) = read_field(data, "#type:")?;
    if kind != "dataframe" {
        return Err(RemoteError::PackUnpack(format!(
            "invalid type string: {kind}"
        )));
    }
    let (dtype, rest) = read_field(rest, "#dtype:")?;
    let (index, csv) = read_field(rest, "#index:")?;

    Ok((DataframeHeader { dtype, index }, csv))
}

/// One `#name:value\n` line off the front of the buffer.
fn read_field<'a>(data: &'a [u8], prefix: &str) -> Result<(String, &'a [u8]), RemoteError> {
    let end = data
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| RemoteError::PackUnpack(format!("missing {prefix} line")))?;
    let line = std::str::from_utf8(&data[..end])
        .map_err(|_| RemoteError::PackUnpack(format!("invalid {prefix} line")))?;
    let value = line
        .strip_prefix(prefix)
        .ok_or_else(|| RemoteError::PackUnpack(format!("missing {prefix} line")))?;
    Ok((value.to_string(), &data[end + 1..]))
}
