use std::path::Path;

use base64::{Engine, prelude::BASE64_STANDARD};
use xmpp_parsers::minidom::Element;

use rookery_xmpp::{
    ProtocolError,
    outbound::NS_SI_FILE,
    router::{NS_IBB, NS_SI},
};

const NS_DATA_FORMS: &str = "jabber:x:data";

/// A parsed stream-initiation file offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Offer {
    pub sid: String,
    pub filename: String,
    pub size: u64,
    pub mime_type: Option<String>,
    /// Whether in-band bytestreams are among the offered stream methods.
    pub offers_ibb: bool,
}

/// One in-band bytestream request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IbbRequest {
    Open { sid: String, block_size: u32 },
    Data { sid: String, seq: u16, data: Vec<u8> },
    Close { sid: String },
}

impl IbbRequest {
    pub fn sid(&self) -> &str {
        match self {
            IbbRequest::Open { sid, .. } | IbbRequest::Data { sid, .. } | IbbRequest::Close { sid } => sid,
        }
    }
}

pub fn parse_offer(si: &Element) -> Result<Offer, ProtocolError> {
    if !si.is("si", NS_SI) {
        return Err(ProtocolError::Unexpected(format!("not a file offer: <{}/>", si.name())));
    }
    let sid = si
        .attr("id")
        .ok_or_else(|| ProtocolError::ParseFailed("file offer without id".into()))?
        .to_string();
    let file = si
        .get_child("file", NS_SI_FILE)
        .ok_or_else(|| ProtocolError::ParseFailed("file offer without <file/>".into()))?;
    let filename = file
        .attr("name")
        .map(sanitize_filename)
        .ok_or_else(|| ProtocolError::ParseFailed("file offer without name".into()))?;
    let size = file
        .attr("size")
        .and_then(|size| size.parse::<u64>().ok())
        .ok_or_else(|| ProtocolError::ParseFailed("file offer without valid size".into()))?;

    let offers_ibb = si
        .children()
        .filter(|child| child.name() == "feature")
        .flat_map(|feature| feature.children())
        .filter(|form| form.is("x", NS_DATA_FORMS))
        .flat_map(|form| form.children())
        .filter(|field| field.attr("var") == Some("stream-method"))
        .flat_map(|field| field.children())
        .filter(|option| option.name() == "option")
        .flat_map(|option| option.children())
        .any(|value| value.text().trim() == NS_IBB);

    Ok(Offer {
        sid,
        filename,
        size,
        mime_type: si.attr("mime-type").map(String::from),
        offers_ibb,
    })
}

pub fn parse_ibb(payload: &Element) -> Result<IbbRequest, ProtocolError> {
    if payload.ns() != NS_IBB {
        return Err(ProtocolError::Unexpected(format!(
            "not a bytestream request: <{}/>",
            payload.name()
        )));
    }
    let sid = payload
        .attr("sid")
        .ok_or_else(|| ProtocolError::ParseFailed("bytestream request without sid".into()))?
        .to_string();
    match payload.name() {
        "open" => {
            let block_size = payload
                .attr("block-size")
                .and_then(|size| size.parse().ok())
                .ok_or_else(|| ProtocolError::ParseFailed("open without valid block-size".into()))?;
            Ok(IbbRequest::Open { sid, block_size })
        }
        "data" => {
            let seq = payload
                .attr("seq")
                .and_then(|seq| seq.parse().ok())
                .ok_or_else(|| ProtocolError::ParseFailed("data without valid seq".into()))?;
            let text: String = payload.text().split_whitespace().collect();
            let data = BASE64_STANDARD
                .decode(text)
                .map_err(|error| ProtocolError::ParseFailed(format!("invalid block: {error}")))?;
            Ok(IbbRequest::Data { sid, seq, data })
        }
        "close" => Ok(IbbRequest::Close { sid }),
        other => Err(ProtocolError::Unexpected(format!("unknown bytestream request <{other}/>"))),
    }
}

/// Strip any directory components a peer put into an offered name.
pub fn sanitize_filename(name: &str) -> String {
    Path::new(name.trim())
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
        .map(String::from)
        .unwrap_or_else(|| "download".to_string())
}
