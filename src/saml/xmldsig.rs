//! Enveloped XML signature extraction.
//!
//! Locates every `ds:Signature` in a SAML document and prepares the byte strings a
//! verifier needs: the canonical `SignedInfo` and the canonical signed element with
//! the signature itself removed (enveloped-signature transform). Element boundaries
//! come from reader byte offsets so nested elements with the same name are handled.
//!
//! Canonicalization follows the algorithm named in the signature. Exclusive C14N
//! (the one SAML IdPs use) renders only visibly utilized namespaces plus the
//! `InclusiveNamespaces` prefix list; inclusive C14N renders every namespace in
//! scope at the apex element. Namespace rendering happens here, the rest of the
//! normalization in `xml_canonicalization`.

use base64::{engine::general_purpose::STANDARD, Engine};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use xml_canonicalization::Canonicalizer;

use super::error::CryptoError;

pub const DSIG_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
pub const ENVELOPED_SIGNATURE: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";
pub const EXC_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
pub const EXC_C14N_WITH_COMMENTS: &str = "http://www.w3.org/2001/10/xml-exc-c14n#WithComments";
pub const C14N: &str = "http://www.w3.org/TR/2001/REC-xml-c14n-20010315";
pub const C14N_WITH_COMMENTS: &str = "http://www.w3.org/TR/2001/REC-xml-c14n-20010315#WithComments";

/// Hash behind a `SignatureMethod` or `DigestMethod`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    /// RSA signature method URIs.
    pub fn from_signature_method(uri: &str) -> Option<Self> {
        match uri {
            "http://www.w3.org/2000/09/xmldsig#rsa-sha1" => Some(Self::Sha1),
            "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256" => Some(Self::Sha256),
            "http://www.w3.org/2001/04/xmldsig-more#rsa-sha384" => Some(Self::Sha384),
            "http://www.w3.org/2001/04/xmldsig-more#rsa-sha512" => Some(Self::Sha512),
            _ => None,
        }
    }

    pub fn from_digest_method(uri: &str) -> Option<Self> {
        match uri {
            "http://www.w3.org/2000/09/xmldsig#sha1" => Some(Self::Sha1),
            "http://www.w3.org/2001/04/xmlenc#sha256" => Some(Self::Sha256),
            "http://www.w3.org/2001/04/xmldsig-more#sha384" => Some(Self::Sha384),
            "http://www.w3.org/2001/04/xmlenc#sha512" => Some(Self::Sha512),
            _ => None,
        }
    }

    pub fn signature_method_uri(&self) -> &'static str {
        match self {
            Self::Sha1 => "http://www.w3.org/2000/09/xmldsig#rsa-sha1",
            Self::Sha256 => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256",
            Self::Sha384 => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha384",
            Self::Sha512 => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha512",
        }
    }

    pub fn digest_method_uri(&self) -> &'static str {
        match self {
            Self::Sha1 => "http://www.w3.org/2000/09/xmldsig#sha1",
            Self::Sha256 => "http://www.w3.org/2001/04/xmlenc#sha256",
            Self::Sha384 => "http://www.w3.org/2001/04/xmldsig-more#sha384",
            Self::Sha512 => "http://www.w3.org/2001/04/xmlenc#sha512",
        }
    }

    pub fn is_deprecated(&self) -> bool {
        matches!(self, Self::Sha1)
    }
}

/// A canonicalization algorithm and its parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct C14nMethod {
    pub exclusive: bool,
    pub with_comments: bool,
    /// `InclusiveNamespaces/@PrefixList`; `#default` names the default namespace.
    pub inclusive_prefixes: Vec<String>,
}

impl C14nMethod {
    pub fn from_uri(uri: &str) -> Option<Self> {
        let (exclusive, with_comments) = match uri {
            EXC_C14N => (true, false),
            EXC_C14N_WITH_COMMENTS => (true, true),
            C14N => (false, false),
            C14N_WITH_COMMENTS => (false, true),
            _ => return None,
        };
        Some(Self {
            exclusive,
            with_comments,
            inclusive_prefixes: Vec::new(),
        })
    }

    pub fn exclusive() -> Self {
        Self {
            exclusive: true,
            with_comments: false,
            inclusive_prefixes: Vec::new(),
        }
    }

    /// Canonical XML 1.0, applied to a Reference with no explicit C14N transform.
    pub fn inclusive() -> Self {
        Self {
            exclusive: false,
            with_comments: false,
            inclusive_prefixes: Vec::new(),
        }
    }
}

/// A signature enveloped in the element it signs.
#[derive(Debug, Clone)]
pub struct EnvelopedSignature {
    /// Local name of the signed element (`Response`, `Assertion`).
    pub element_name: String,
    pub element_id: String,
    /// Ancestors of the signed element; 0 for the document root.
    pub depth: usize,
    pub reference_uri: String,
    pub signature_method: HashAlgorithm,
    pub digest_method: HashAlgorithm,
    pub digest_value: Vec<u8>,
    pub signature_value: Vec<u8>,
    pub canonical_signed_info: Vec<u8>,
    /// Signed element, signature removed, canonicalized.
    pub canonical_element: Vec<u8>,
}

/// Position of an element the protocol engine cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedElement {
    pub id: Option<String>,
    pub depth: usize,
}

/// Signatures found in a document plus the facts needed to detect wrapping.
#[derive(Debug, Clone, Default)]
pub struct SignatureScan {
    pub signatures: Vec<EnvelopedSignature>,
    /// Every `Assertion` element, in document order.
    pub assertions: Vec<ScannedElement>,
    pub encrypted_assertions: Vec<ScannedElement>,
}

/// Parse `xml` and extract every enveloped signature.
///
/// Documents in which two elements share an `ID` are rejected; a reference by ID
/// must be unambiguous.
pub fn scan(xml: &str) -> Result<SignatureScan, CryptoError> {
    let tree = XmlTree::parse(xml)?;

    let mut seen = HashSet::new();
    for idx in 0..tree.nodes.len() {
        if let Some(id) = tree.attribute(idx, "ID") {
            if !seen.insert(id) {
                return Err(malformed(format!("duplicate ID {}", id)));
            }
        }
    }

    let mut result = SignatureScan::default();
    for idx in 0..tree.nodes.len() {
        let element = || ScannedElement {
            id: tree.attribute(idx, "ID").map(str::to_string),
            depth: tree.depth(idx),
        };
        match tree.nodes[idx].local_name.as_str() {
            "Assertion" => result.assertions.push(element()),
            "EncryptedAssertion" => result.encrypted_assertions.push(element()),
            "Signature" if tree.namespace_of(idx) == Some(DSIG_NS) => {
                result.signatures.push(tree.enveloped_signature(idx)?)
            }
            _ => {}
        }
    }

    Ok(result)
}

/// The element carrying `ID="{id}"` as a standalone document, with the namespace
/// declarations it inherits copied onto it.
pub fn standalone_element(xml: &str, id: &str) -> Result<String, CryptoError> {
    let tree = XmlTree::parse(xml)?;
    let idx = tree.find_by_id(id)?;
    Ok(tree.standalone(idx))
}

/// Canonical form of the element carrying `ID="{id}"`.
#[cfg(test)]
pub(crate) fn canonical_element_by_id(
    xml: &str,
    id: &str,
    method: &C14nMethod,
) -> Result<Vec<u8>, CryptoError> {
    let tree = XmlTree::parse(xml)?;
    let idx = tree.find_by_id(id)?;
    tree.canonical_subtree(idx, None, method)
}

fn canonicalize(xml: &str, with_comments: bool) -> Result<Vec<u8>, CryptoError> {
    let mut output = Vec::new();
    Canonicalizer::read_from_str(xml)
        .write_to_writer(&mut output)
        .canonicalize(with_comments)
        .map_err(|e| malformed(format!("canonicalization failed: {}", e)))?;
    Ok(output)
}

fn malformed(msg: impl Into<String>) -> CryptoError {
    CryptoError::MalformedSignature(msg.into())
}

/// `xmlns` → `""`, `xmlns:p` → `p`.
fn declared_prefix(name: &str) -> &str {
    name.strip_prefix("xmlns:").unwrap_or("")
}

fn declaration(prefix: &str, uri: &str) -> String {
    if prefix.is_empty() {
        format!(" xmlns=\"{}\"", escape_attr(uri))
    } else {
        format!(" xmlns:{}=\"{}\"", prefix, escape_attr(uri))
    }
}

#[derive(Debug)]
pub(crate) struct Node {
    pub qname: String,
    pub local_name: String,
    /// Byte offset of `<`.
    pub start: usize,
    /// Byte offset just past the closing `>`.
    pub end: usize,
    pub parent: Option<usize>,
    attributes: Vec<(String, String)>,
    /// `xmlns` / `xmlns:p` declarations made on this element.
    namespaces: Vec<(String, String)>,
    pub text: String,
}

/// Flat, document-ordered element list with byte spans.
pub(crate) struct XmlTree<'a> {
    xml: &'a str,
    pub nodes: Vec<Node>,
}

impl<'a> XmlTree<'a> {
    pub fn parse(xml: &'a str) -> Result<Self, CryptoError> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(false);

        let mut nodes: Vec<Node> = Vec::new();
        let mut stack: Vec<usize> = Vec::new();

        loop {
            let start = reader.buffer_position() as usize;
            let event = reader
                .read_event()
                .map_err(|e| malformed(format!("XML parse error: {}", e)))?;
            let end = reader.buffer_position() as usize;

            match event {
                Event::Start(e) => {
                    let node = open_node(&e, start, stack.last().copied())?;
                    nodes.push(node);
                    stack.push(nodes.len() - 1);
                }
                Event::Empty(e) => {
                    let mut node = open_node(&e, start, stack.last().copied())?;
                    node.end = end;
                    nodes.push(node);
                }
                Event::End(_) => {
                    let idx = stack
                        .pop()
                        .ok_or_else(|| malformed("unbalanced end tag"))?;
                    nodes[idx].end = end;
                }
                Event::Text(t) => {
                    if let Some(&idx) = stack.last() {
                        let text = t
                            .unescape()
                            .map_err(|e| malformed(format!("invalid text: {}", e)))?;
                        nodes[idx].text.push_str(&text);
                    }
                }
                Event::CData(c) => {
                    if let Some(&idx) = stack.last() {
                        nodes[idx].text.push_str(&String::from_utf8_lossy(&c));
                    }
                }
                Event::DocType(_) => return Err(malformed("DOCTYPE is not allowed")),
                Event::Eof => break,
                _ => {}
            }
        }

        if !stack.is_empty() {
            return Err(malformed("unexpected end of document"));
        }

        Ok(Self { xml, nodes })
    }

    pub fn attribute(&self, idx: usize, name: &str) -> Option<&str> {
        self.nodes[idx]
            .attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    fn find_by_id(&self, id: &str) -> Result<usize, CryptoError> {
        (0..self.nodes.len())
            .find(|&i| self.attribute(i, "ID") == Some(id))
            .ok_or_else(|| malformed(format!("no element with ID {}", id)))
    }

    fn ancestors(&self, idx: usize) -> Vec<usize> {
        let mut chain = Vec::new();
        let mut current = self.nodes[idx].parent;
        while let Some(parent) = current {
            chain.push(parent);
            current = self.nodes[parent].parent;
        }
        chain
    }

    pub fn depth(&self, idx: usize) -> usize {
        self.ancestors(idx).len()
    }

    /// Namespace URI of the element's own prefix.
    fn namespace_of(&self, idx: usize) -> Option<&str> {
        let qname = &self.nodes[idx].qname;
        let decl = match qname.split_once(':') {
            Some((prefix, _)) => format!("xmlns:{}", prefix),
            None => "xmlns".to_string(),
        };

        std::iter::once(idx)
            .chain(self.ancestors(idx))
            .find_map(|i| {
                self.nodes[i]
                    .namespaces
                    .iter()
                    .find(|(name, _)| *name == decl)
                    .map(|(_, uri)| uri.as_str())
            })
    }

    /// Prefix → URI bindings declared by the element's ancestors.
    fn inherited_scope(&self, idx: usize) -> BTreeMap<String, String> {
        let mut scope = BTreeMap::new();
        for ancestor in self.ancestors(idx).into_iter().rev() {
            for (name, uri) in &self.nodes[ancestor].namespaces {
                scope.insert(declared_prefix(name).to_string(), uri.clone());
            }
        }
        scope
    }

    /// Descendants are contiguous in document order.
    pub fn descendants(&self, idx: usize) -> impl Iterator<Item = usize> + '_ {
        let end = self.nodes[idx].end;
        (idx + 1..self.nodes.len()).take_while(move |&i| self.nodes[i].start < end)
    }

    pub fn children(&self, idx: usize) -> impl Iterator<Item = usize> + '_ {
        self.descendants(idx)
            .filter(move |&i| self.nodes[i].parent == Some(idx))
    }

    pub fn first_descendant(&self, idx: usize, local_name: &str) -> Option<usize> {
        self.descendants(idx)
            .find(|&i| self.nodes[i].local_name == local_name)
    }

    pub fn first_child(&self, idx: usize, local_name: &str) -> Option<usize> {
        self.children(idx)
            .find(|&i| self.nodes[i].local_name == local_name)
    }

    /// Source text of the element, optionally without one descendant (the
    /// enveloped signature).
    fn subtree_text(&self, idx: usize, exclude: Option<usize>) -> String {
        let node = &self.nodes[idx];
        let mut text = self.xml[node.start..node.end].to_string();
        if let Some(skip) = exclude {
            let skipped = &self.nodes[skip];
            text.replace_range(skipped.start - node.start..skipped.end - node.start, "");
        }
        text
    }

    /// The element as its own document: every inherited binding it does not
    /// redeclare is copied onto its start tag.
    pub fn standalone(&self, idx: usize) -> String {
        let node = &self.nodes[idx];
        let mut text = self.subtree_text(idx, None);

        let declarations: String = self
            .inherited_scope(idx)
            .iter()
            .filter(|(prefix, _)| {
                !node
                    .namespaces
                    .iter()
                    .any(|(name, _)| declared_prefix(name) == prefix.as_str())
            })
            .map(|(prefix, uri)| declaration(prefix, uri))
            .collect();
        text.insert_str(1 + node.qname.len(), &declarations);
        text
    }

    fn canonical_subtree(
        &self,
        idx: usize,
        exclude: Option<usize>,
        method: &C14nMethod,
    ) -> Result<Vec<u8>, CryptoError> {
        let prepared = render_namespaces(
            &self.subtree_text(idx, exclude),
            self.inherited_scope(idx),
            method,
        )?;
        canonicalize(&prepared, method.with_comments)
    }

    /// `CanonicalizationMethod` or C14N `Transform`, with its prefix list.
    fn c14n_method(&self, idx: usize) -> Result<C14nMethod, CryptoError> {
        let algorithm = self.attribute(idx, "Algorithm").unwrap_or_default();
        let mut method = C14nMethod::from_uri(algorithm)
            .ok_or_else(|| CryptoError::UnsupportedAlgorithm(algorithm.to_string()))?;
        if method.exclusive {
            if let Some(list) = self
                .first_child(idx, "InclusiveNamespaces")
                .and_then(|i| self.attribute(i, "PrefixList"))
            {
                method.inclusive_prefixes = list.split_whitespace().map(str::to_string).collect();
            }
        }
        Ok(method)
    }

    fn enveloped_signature(&self, sig: usize) -> Result<EnvelopedSignature, CryptoError> {
        let parent = self.nodes[sig]
            .parent
            .ok_or_else(|| malformed("Signature is the document root"))?;
        let element_id = self
            .attribute(parent, "ID")
            .ok_or_else(|| malformed("signed element has no ID attribute"))?
            .to_string();

        let signed_info = self
            .first_child(sig, "SignedInfo")
            .ok_or_else(|| malformed("missing SignedInfo"))?;
        let signed_info_method = self
            .first_child(signed_info, "CanonicalizationMethod")
            .ok_or_else(|| malformed("missing CanonicalizationMethod"))
            .and_then(|i| self.c14n_method(i))?;

        let references: Vec<usize> = self
            .children(signed_info)
            .filter(|&i| self.nodes[i].local_name == "Reference")
            .collect();
        let reference = match references.as_slice() {
            [only] => *only,
            [] => return Err(malformed("missing Reference")),
            _ => return Err(malformed("multiple References are not supported")),
        };
        let reference_uri = self.attribute(reference, "URI").unwrap_or_default().to_string();

        // A same-document reference drops comments whatever the transform says.
        let mut element_method = C14nMethod::inclusive();
        let mut enveloped = false;
        for transform in self
            .descendants(reference)
            .filter(|&i| self.nodes[i].local_name == "Transform")
        {
            let algorithm = self.attribute(transform, "Algorithm").unwrap_or_default();
            if algorithm == ENVELOPED_SIGNATURE {
                enveloped = true;
            } else {
                element_method = self.c14n_method(transform)?;
                element_method.with_comments = false;
            }
        }
        if !enveloped {
            return Err(malformed("Reference lacks the enveloped-signature transform"));
        }

        let signature_method = self
            .first_child(signed_info, "SignatureMethod")
            .and_then(|i| self.attribute(i, "Algorithm"))
            .ok_or_else(|| malformed("missing SignatureMethod"))?;
        let signature_method = HashAlgorithm::from_signature_method(signature_method)
            .ok_or_else(|| CryptoError::UnsupportedAlgorithm(signature_method.to_string()))?;

        let digest_method = self
            .first_child(reference, "DigestMethod")
            .and_then(|i| self.attribute(i, "Algorithm"))
            .ok_or_else(|| malformed("missing DigestMethod"))?;
        let digest_method = HashAlgorithm::from_digest_method(digest_method)
            .ok_or_else(|| CryptoError::UnsupportedAlgorithm(digest_method.to_string()))?;

        let digest_value = self
            .first_child(reference, "DigestValue")
            .map(|i| self.nodes[i].text.as_str())
            .ok_or_else(|| malformed("missing DigestValue"))?;

        let signature_value = self
            .first_child(sig, "SignatureValue")
            .map(|i| self.nodes[i].text.as_str())
            .ok_or_else(|| malformed("missing SignatureValue"))?;

        Ok(EnvelopedSignature {
            element_name: self.nodes[parent].local_name.clone(),
            element_id,
            depth: self.depth(parent),
            reference_uri,
            signature_method,
            digest_method,
            digest_value: decode_base64(digest_value)?,
            signature_value: decode_base64(signature_value)?,
            canonical_signed_info: self.canonical_subtree(signed_info, None, &signed_info_method)?,
            canonical_element: self.canonical_subtree(parent, Some(sig), &element_method)?,
        })
    }
}

/// Rewrite every start tag in `text` so that it declares exactly the namespace
/// bindings canonicalization renders for it.
///
/// `inherited` holds the bindings in scope above the apex element. Exclusive
/// C14N renders visibly utilized prefixes plus the prefix list; inclusive C14N
/// renders every binding in scope. Declarations are written after the other
/// attributes; the canonicalizer then sorts attributes and normalizes the rest
/// of the markup.
fn render_namespaces(
    text: &str,
    inherited: Bindings,
    method: &C14nMethod,
) -> Result<String, CryptoError> {
    let inclusive: Vec<&str> = method
        .inclusive_prefixes
        .iter()
        .map(|p| if p == "#default" { "" } else { p.as_str() })
        .collect();
    let prefixes = if method.exclusive { Some(inclusive.as_slice()) } else { None };

    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(false);

    let mut output = String::with_capacity(text.len());
    // (bindings in scope, bindings rendered by output ancestors)
    let mut stack: Vec<(Bindings, Bindings)> = vec![(inherited, Bindings::new())];

    loop {
        let start = reader.buffer_position() as usize;
        let event = reader
            .read_event()
            .map_err(|e| malformed(format!("XML parse error: {}", e)))?;
        let end = reader.buffer_position() as usize;

        match event {
            Event::Start(e) | Event::Empty(e) => {
                let (scope, rendered) = stack
                    .last()
                    .ok_or_else(|| malformed("unbalanced end tag"))?;
                let (tag, scope, rendered) = rewrite_start_tag(&e, scope, rendered, prefixes)?;
                output.push('<');
                output.push_str(&tag);
                if text[start..end].ends_with("/>") {
                    output.push_str("/>");
                } else {
                    output.push('>');
                    stack.push((scope, rendered));
                }
            }
            Event::End(_) => {
                stack.pop();
                output.push_str(&text[start..end]);
            }
            Event::Eof => break,
            _ => output.push_str(&text[start..end]),
        }
    }

    Ok(output)
}

type Bindings = BTreeMap<String, String>;

/// `exclusive` is the prefix list for exclusive C14N, `None` for inclusive.
fn rewrite_start_tag(
    e: &BytesStart<'_>,
    scope: &Bindings,
    rendered: &Bindings,
    exclusive: Option<&[&str]>,
) -> Result<(String, Bindings, Bindings), CryptoError> {
    let qname = std::str::from_utf8(e.name().as_ref())
        .map_err(|_| malformed("element name is not UTF-8"))?
        .to_string();

    let mut scope = scope.clone();
    let mut attributes = String::new();
    let mut utilized = BTreeSet::new();
    utilized.insert(qname.split_once(':').map(|(p, _)| p).unwrap_or("").to_string());

    for attr in e.attributes() {
        let attr = attr.map_err(|e| malformed(format!("invalid attribute: {}", e)))?;
        let key = std::str::from_utf8(attr.key.as_ref())
            .map_err(|_| malformed("attribute name is not UTF-8"))?;

        if key == "xmlns" || key.starts_with("xmlns:") {
            let uri = attr
                .unescape_value()
                .map_err(|e| malformed(format!("invalid attribute value: {}", e)))?;
            scope.insert(declared_prefix(key).to_string(), uri.into_owned());
            continue;
        }

        if let Some((prefix, _)) = key.split_once(':') {
            utilized.insert(prefix.to_string());
        }
        let raw = std::str::from_utf8(&attr.value)
            .map_err(|_| malformed("attribute value is not UTF-8"))?;
        attributes.push_str(&format!(" {}=\"{}\"", key, raw.replace('"', "&quot;")));
    }

    match exclusive {
        Some(inclusive) => {
            for prefix in inclusive {
                if scope.contains_key(*prefix) {
                    utilized.insert(prefix.to_string());
                }
            }
        }
        None => utilized.extend(scope.keys().cloned()),
    }

    let mut rendered = rendered.clone();
    let mut declarations = String::new();
    for prefix in utilized {
        if prefix == "xml" {
            continue;
        }
        let uri = match scope.get(&prefix) {
            Some(uri) => uri.clone(),
            None if prefix.is_empty() => String::new(),
            None => continue,
        };
        // An unrendered default namespace is the empty one.
        let needed = if prefix.is_empty() {
            uri != rendered.get(&prefix).map(String::as_str).unwrap_or("")
        } else {
            rendered.get(&prefix) != Some(&uri)
        };
        if needed {
            declarations.push_str(&declaration(&prefix, &uri));
            rendered.insert(prefix, uri);
        }
    }

    Ok((format!("{}{}{}", qname, attributes, declarations), scope, rendered))
}

fn open_node(e: &BytesStart<'_>, start: usize, parent: Option<usize>) -> Result<Node, CryptoError> {
    let qname = std::str::from_utf8(e.name().as_ref())
        .map_err(|_| malformed("element name is not UTF-8"))?
        .to_string();
    let local_name = std::str::from_utf8(e.local_name().as_ref())
        .map_err(|_| malformed("element name is not UTF-8"))?
        .to_string();

    let mut attributes = Vec::new();
    let mut namespaces = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| malformed(format!("invalid attribute: {}", e)))?;
        let key = std::str::from_utf8(attr.key.as_ref())
            .map_err(|_| malformed("attribute name is not UTF-8"))?
            .to_string();
        let value = attr
            .unescape_value()
            .map_err(|e| malformed(format!("invalid attribute value: {}", e)))?
            .into_owned();

        if key == "xmlns" || key.starts_with("xmlns:") {
            namespaces.push((key, value));
        } else {
            attributes.push((key, value));
        }
    }

    Ok(Node {
        qname,
        local_name,
        start,
        end: start,
        parent,
        attributes,
        namespaces,
        text: String::new(),
    })
}

pub(crate) fn decode_base64(text: &str) -> Result<Vec<u8>, CryptoError> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| malformed(format!("invalid base64: {}", e)))
}

fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{generate_keypair, sign_element, ResponseFixture};

    const SIGNED_VECTOR: &str = include_str!("testdata/idp_signed_response.xml");
    const VECTOR_ASSERTION_C14N: &str = include_str!("testdata/idp_assertion.c14n");
    const VECTOR_ASSERTION_ID: &str = "_d71a3a8e9fcc45c9e9d248ef7049393fc8f04e5f75";

    fn canonical(xml: &str, id: &str) -> String {
        String::from_utf8(canonical_element_by_id(xml, id, &C14nMethod::exclusive()).unwrap()).unwrap()
    }

    #[test]
    fn test_algorithm_uris() {
        for alg in [
            HashAlgorithm::Sha1,
            HashAlgorithm::Sha256,
            HashAlgorithm::Sha384,
            HashAlgorithm::Sha512,
        ] {
            assert_eq!(HashAlgorithm::from_signature_method(alg.signature_method_uri()), Some(alg));
            assert_eq!(HashAlgorithm::from_digest_method(alg.digest_method_uri()), Some(alg));
        }
        assert!(HashAlgorithm::Sha1.is_deprecated());
        assert!(!HashAlgorithm::Sha256.is_deprecated());
        assert_eq!(HashAlgorithm::from_signature_method("urn:unknown"), None);
    }

    #[test]
    fn test_c14n_method_uris() {
        assert_eq!(C14nMethod::from_uri(EXC_C14N), Some(C14nMethod::exclusive()));
        assert_eq!(C14nMethod::from_uri(C14N), Some(C14nMethod::inclusive()));
        assert!(C14nMethod::from_uri(C14N_WITH_COMMENTS).unwrap().with_comments);
        assert_eq!(C14nMethod::from_uri("http://www.w3.org/2006/12/xml-c14n11"), None);
    }

    #[test]
    fn test_unsigned_document_has_no_signatures() {
        let xml = ResponseFixture::default().to_xml();
        let scan = scan(&xml).unwrap();
        assert!(scan.signatures.is_empty());
        assert_eq!(scan.assertions.len(), 1);
        assert_eq!(scan.assertions[0].depth, 1);
        assert!(scan.encrypted_assertions.is_empty());
    }

    #[test]
    fn test_enveloped_transform_restores_original_element() {
        let (cert, key) = generate_keypair("idp.example.com");
        let fixture = ResponseFixture::default();
        let unsigned = fixture.to_xml();
        let before = canonical(&unsigned, &fixture.assertion_id);

        let signed = sign_element(&unsigned, &fixture.assertion_id, &key, &cert);
        let scan = scan(&signed).unwrap();

        assert_eq!(scan.signatures.len(), 1);
        let sig = &scan.signatures[0];
        assert_eq!(sig.element_name, "Assertion");
        assert_eq!(sig.element_id, fixture.assertion_id);
        assert_eq!(sig.depth, 1);
        assert_eq!(sig.reference_uri, format!("#{}", fixture.assertion_id));
        assert_eq!(sig.signature_method, HashAlgorithm::Sha256);
        assert_eq!(String::from_utf8(sig.canonical_element.clone()).unwrap(), before);
        assert!(!sig.signature_value.is_empty());
    }

    #[test]
    fn test_nested_signatures_are_both_found() {
        let (cert, key) = generate_keypair("idp.example.com");
        let fixture = ResponseFixture::default();
        let xml = sign_element(&fixture.to_xml(), &fixture.assertion_id, &key, &cert);
        let xml = sign_element(&xml, &fixture.response_id, &key, &cert);

        let scan = scan(&xml).unwrap();
        let found: Vec<(&str, usize)> = scan
            .signatures
            .iter()
            .map(|s| (s.element_name.as_str(), s.depth))
            .collect();
        assert_eq!(found, vec![("Response", 0), ("Assertion", 1)]);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let xml = r#"<r ID="a"><x ID="b"/><y ID="b"/></r>"#;
        assert!(matches!(scan(xml), Err(CryptoError::MalformedSignature(m)) if m.contains("duplicate ID")));
    }

    #[test]
    fn test_doctype_rejected() {
        let xml = r#"<!DOCTYPE foo [<!ENTITY x "y">]><root/>"#;
        assert!(matches!(scan(xml), Err(CryptoError::MalformedSignature(_))));
    }

    #[test]
    fn test_exclusive_c14n_renders_only_utilized_namespaces() {
        let xml = concat!(
            r#"<p:Outer xmlns:p="urn:outer" xmlns:q="urn:unused" xmlns:r="urn:attr" ID="o">"#,
            r#"<p:Inner  r:flag='on'   ID="i"><p:Leaf/><Plain/></p:Inner></p:Outer>"#,
        );
        assert_eq!(
            canonical(xml, "i"),
            concat!(
                r#"<p:Inner xmlns:p="urn:outer" xmlns:r="urn:attr" ID="i" r:flag="on">"#,
                r#"<p:Leaf></p:Leaf><Plain></Plain></p:Inner>"#,
            )
        );
    }

    #[test]
    fn test_inclusive_prefix_list_and_default_namespace() {
        let xml = r#"<Outer xmlns="urn:default" xmlns:xs="urn:xs" ID="o"><Inner ID="i"><x:Leaf xmlns:x="urn:x"/></Inner></Outer>"#;
        let method = C14nMethod {
            inclusive_prefixes: vec!["xs".to_string()],
            ..C14nMethod::exclusive()
        };
        let canonical = String::from_utf8(canonical_element_by_id(xml, "i", &method).unwrap()).unwrap();
        assert_eq!(
            canonical,
            r#"<Inner xmlns="urn:default" xmlns:xs="urn:xs" ID="i"><x:Leaf xmlns:x="urn:x"></x:Leaf></Inner>"#
        );
    }

    #[test]
    fn test_inclusive_c14n_keeps_inherited_namespaces() {
        let xml = r#"<p:Outer xmlns:p="urn:outer" xmlns:q="urn:unused" ID="o"><p:Inner ID="i"/></p:Outer>"#;
        let canonical =
            String::from_utf8(canonical_element_by_id(xml, "i", &C14nMethod::inclusive()).unwrap()).unwrap();
        assert_eq!(
            canonical,
            r#"<p:Inner xmlns:p="urn:outer" xmlns:q="urn:unused" ID="i"></p:Inner>"#
        );
    }

    #[test]
    fn test_externally_canonicalized_assertion_matches() {
        let scan = scan(SIGNED_VECTOR).unwrap();
        let sig = &scan.signatures[0];
        assert_eq!(sig.element_id, VECTOR_ASSERTION_ID);
        assert_eq!(
            String::from_utf8(sig.canonical_element.clone()).unwrap(),
            VECTOR_ASSERTION_C14N.trim_end_matches('\n')
        );
    }

    #[test]
    fn test_unsupported_canonicalization_rejected() {
        let (cert, key) = generate_keypair("idp.example.com");
        let fixture = ResponseFixture::default();
        let xml = sign_element(&fixture.to_xml(), &fixture.assertion_id, &key, &cert)
            .replace(EXC_C14N, "http://www.w3.org/2006/12/xml-c14n11");
        assert!(matches!(scan(&xml), Err(CryptoError::UnsupportedAlgorithm(_))));
    }

    #[test]
    fn test_standalone_element_carries_inherited_namespaces() {
        let xml = r#"<p:Outer xmlns:p="urn:outer" ID="o"><p:Inner ID="i">text</p:Inner></p:Outer>"#;
        assert_eq!(
            standalone_element(xml, "i").unwrap(),
            r#"<p:Inner xmlns:p="urn:outer" ID="i">text</p:Inner>"#
        );
    }
}
