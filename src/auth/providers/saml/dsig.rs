// XML-DSig verification for SAML responses: canonicalization, reference digest and signature value

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use ring::digest;
use ring::signature::{self, UnparsedPublicKey, VerificationAlgorithm};
use std::collections::{BTreeMap, BTreeSet};

use crate::auth::{AuthError, Result};

pub const DSIG_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
pub const EXC_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
pub const C14N: &str = "http://www.w3.org/TR/2001/REC-xml-c14n-20010315";
pub const ENVELOPED: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";
pub const SHA1: &str = "http://www.w3.org/2000/09/xmldsig#sha1";
pub const SHA256: &str = "http://www.w3.org/2001/04/xmlenc#sha256";
pub const SHA512: &str = "http://www.w3.org/2001/04/xmlenc#sha512";
pub const RSA_SHA1: &str = "http://www.w3.org/2000/09/xmldsig#rsa-sha1";
pub const RSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";
pub const RSA_SHA512: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha512";
pub const ECDSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha256";
pub const ECDSA_SHA384: &str = "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha384";
const XML_NS: &str = "http://www.w3.org/XML/1998/namespace";

/// In-scope namespace declarations by prefix, `""` for the default namespace.
type Scope = BTreeMap<String, String>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Element {
    /// Qualified name as written, e.g. `saml:Assertion`.
    pub name: String,
    /// Attributes as written, namespace declarations included.
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Element(Element),
    Text(String),
}

fn split_qname(name: &str) -> (&str, &str) {
    match name.split_once(':') {
        Some((prefix, local)) => (prefix, local),
        None => ("", name),
    }
}

impl Element {
    pub fn local_name(&self) -> &str {
        split_qname(&self.name).1
    }

    fn prefix(&self) -> &str {
        split_qname(&self.name).0
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    fn elements(&self) -> impl Iterator<Item = (usize, &Element)> {
        self.children.iter().enumerate().filter_map(|(i, n)| match n {
            Node::Element(e) => Some((i, e)),
            Node::Text(_) => None,
        })
    }

    fn child(&self, local: &str) -> Option<&Element> {
        self.elements().map(|(_, e)| e).find(|e| e.local_name() == local)
    }

    fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|n| match n {
                Node::Text(t) => Some(t.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    fn declarations(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attrs.iter().filter_map(|(k, v)| {
            if k == "xmlns" {
                Some(("", v.as_str()))
            } else {
                k.strip_prefix("xmlns:").map(|p| (p, v.as_str()))
            }
        })
    }
}

fn malformed(e: impl std::fmt::Display) -> AuthError {
    AuthError::BadRequest(format!("invalid saml document: {}", e))
}

fn denied(msg: impl Into<String>) -> AuthError {
    AuthError::Forbidden(msg.into())
}

fn start_element(e: &BytesStart) -> Result<Element> {
    let mut attrs = Vec::new();
    for a in e.attributes() {
        let a = a.map_err(malformed)?;
        let key = String::from_utf8_lossy(a.key.as_ref()).into_owned();
        let value = a.unescape_value().map_err(malformed)?.into_owned();
        attrs.push((key, value));
    }
    Ok(Element {
        name: String::from_utf8_lossy(e.name().as_ref()).into_owned(),
        attrs,
        children: Vec::new(),
    })
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) -> Result<()> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(Node::Element(element)),
        None if root.is_some() => return Err(malformed("more than one root element")),
        None => *root = Some(element),
    }
    Ok(())
}

/// Element tree of a document. Comments and processing instructions are
/// dropped and document type declarations are refused.
pub fn parse(xml: &str) -> Result<Element> {
    let normalized = xml.replace("\r\n", "\n").replace('\r', "\n");
    let mut reader = Reader::from_str(&normalized);
    let mut stack: Vec<Element> = Vec::new();
    let mut root = None;
    loop {
        match reader.read_event().map_err(malformed)? {
            Event::Start(e) => stack.push(start_element(&e)?),
            Event::Empty(e) => {
                let element = start_element(&e)?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::End(_) => {
                let element = stack.pop().ok_or_else(|| malformed("unbalanced end tag"))?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::Text(t) => {
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(Node::Text(t.unescape().map_err(malformed)?.into_owned()));
                }
            }
            Event::CData(c) => {
                if let Some(parent) = stack.last_mut() {
                    parent
                        .children
                        .push(Node::Text(String::from_utf8_lossy(&c.into_inner()).into_owned()));
                }
            }
            Event::DocType(_) => return Err(malformed("document type declarations are not allowed")),
            Event::Eof => break,
            _ => {}
        }
    }
    if !stack.is_empty() {
        return Err(malformed("unclosed element"));
    }
    root.ok_or_else(|| malformed("no root element"))
}

fn escape_text(s: &str, out: &mut String) {
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\r' => out.push_str("&#xD;"),
            c => out.push(c),
        }
    }
}

fn escape_attr(s: &str, out: &mut String) {
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            '\t' => out.push_str("&#x9;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            c => out.push(c),
        }
    }
}

/// Canonical XML 1.0 or Exclusive Canonical XML, both without comments.
#[derive(Debug, Clone, PartialEq)]
pub struct Canonicalization {
    exclusive: bool,
    /// `InclusiveNamespaces PrefixList` of the exclusive form.
    prefixes: BTreeSet<String>,
}

impl Canonicalization {
    pub fn exclusive() -> Self {
        Self {
            exclusive: true,
            prefixes: BTreeSet::new(),
        }
    }

    pub fn inclusive() -> Self {
        Self {
            exclusive: false,
            prefixes: BTreeSet::new(),
        }
    }

    /// From a `CanonicalizationMethod` or `Transform` algorithm and the
    /// element carrying it.
    pub fn from_algorithm(algorithm: &str, method: Option<&Element>) -> Result<Self> {
        let mut c14n = match algorithm {
            EXC_C14N => Self::exclusive(),
            C14N => Self::inclusive(),
            other => return Err(denied(format!("unsupported canonicalization {}", other))),
        };
        if let Some(list) = method
            .and_then(|m| m.child("InclusiveNamespaces"))
            .and_then(|n| n.attr("PrefixList"))
        {
            c14n.prefixes = list
                .split_whitespace()
                .map(|p| if p == "#default" { String::new() } else { p.to_string() })
                .collect();
        }
        Ok(c14n)
    }

    /// Canonical form of `element`, whose ancestors declared `inherited`.
    pub fn canonicalize(&self, element: &Element, inherited: &Scope) -> String {
        let mut out = String::new();
        self.write(element, inherited, &Scope::new(), &mut out);
        out
    }

    fn write(&self, e: &Element, parent_scope: &Scope, rendered: &Scope, out: &mut String) {
        let mut scope = parent_scope.clone();
        for (prefix, uri) in e.declarations() {
            scope.insert(prefix.to_string(), uri.to_string());
        }

        let candidates: BTreeSet<String> = if self.exclusive {
            let mut used: BTreeSet<String> = self
                .prefixes
                .iter()
                .filter(|p| scope.contains_key(p.as_str()))
                .cloned()
                .collect();
            used.insert(e.prefix().to_string());
            for (name, _) in &e.attrs {
                let (prefix, _) = split_qname(name);
                if !prefix.is_empty() && prefix != "xmlns" {
                    used.insert(prefix.to_string());
                }
            }
            used
        } else {
            scope.keys().cloned().collect()
        };

        let mut next_rendered = rendered.clone();
        let mut namespaces = Vec::new();
        for prefix in candidates {
            if prefix == "xml" {
                continue;
            }
            let uri = scope.get(&prefix).cloned().unwrap_or_default();
            if prefix.is_empty() {
                // xmlns="" only undoes a default an output ancestor rendered.
                if uri.is_empty() && rendered.get("").map_or(true, String::is_empty) {
                    continue;
                }
            } else if uri.is_empty() {
                continue;
            }
            if rendered.get(&prefix) == Some(&uri) {
                continue;
            }
            next_rendered.insert(prefix.clone(), uri.clone());
            namespaces.push((prefix, uri));
        }

        let mut attrs: Vec<(String, &str, &str, &str)> = e
            .attrs
            .iter()
            .filter(|(k, _)| k != "xmlns" && !k.starts_with("xmlns:"))
            .map(|(k, v)| {
                let (prefix, local) = split_qname(k);
                let uri = match prefix {
                    "" => String::new(),
                    "xml" => XML_NS.to_string(),
                    p => scope.get(p).cloned().unwrap_or_default(),
                };
                (uri, local, k.as_str(), v.as_str())
            })
            .collect();
        attrs.sort_by(|a, b| (&a.0, a.1).cmp(&(&b.0, b.1)));

        out.push('<');
        out.push_str(&e.name);
        for (prefix, uri) in &namespaces {
            if prefix.is_empty() {
                out.push_str(" xmlns=\"");
            } else {
                out.push_str(" xmlns:");
                out.push_str(prefix);
                out.push_str("=\"");
            }
            escape_attr(uri, out);
            out.push('"');
        }
        for (_, _, name, value) in &attrs {
            out.push(' ');
            out.push_str(name);
            out.push_str("=\"");
            escape_attr(value, out);
            out.push('"');
        }
        out.push('>');
        for child in &e.children {
            match child {
                Node::Text(t) => escape_text(t, out),
                Node::Element(c) => self.write(c, &scope, &next_rendered, out),
            }
        }
        out.push_str("</");
        out.push_str(&e.name);
        out.push('>');
    }
}

fn element_at<'a>(root: &'a Element, path: &[usize]) -> Option<&'a Element> {
    let mut current = root;
    for &i in path {
        current = match current.children.get(i)? {
            Node::Element(e) => e,
            Node::Text(_) => return None,
        };
    }
    Some(current)
}

/// Namespaces declared by the ancestors of the element at `path`.
fn inherited_scope(root: &Element, path: &[usize]) -> Scope {
    let mut scope = Scope::new();
    let mut current = root;
    for &i in path {
        for (prefix, uri) in current.declarations() {
            scope.insert(prefix.to_string(), uri.to_string());
        }
        match current.children.get(i) {
            Some(Node::Element(e)) => current = e,
            _ => break,
        }
    }
    scope
}

/// The response itself when it carries the signature, else the first
/// assertion that does.
fn signed_element_path(root: &Element) -> Result<Vec<usize>> {
    let signed = |e: &Element| e.child("Signature").is_some();
    if signed(root) {
        return Ok(Vec::new());
    }
    for (i, child) in root.elements() {
        match child.local_name() {
            "Assertion" if signed(child) => return Ok(vec![i]),
            "EncryptedAssertion" => return Err(denied("encrypted assertions are not supported")),
            _ => {}
        }
    }
    Err(denied("saml response is not signed"))
}

fn decode_b64(text: &str, what: &str) -> Result<Vec<u8>> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD
        .decode(compact)
        .map_err(|e| denied(format!("invalid {}: {}", what, e)))
}

fn digest_algorithm(uri: &str) -> Result<&'static digest::Algorithm> {
    match uri {
        SHA1 => Ok(&digest::SHA1_FOR_LEGACY_USE_ONLY),
        SHA256 => Ok(&digest::SHA256),
        SHA512 => Ok(&digest::SHA512),
        other => Err(denied(format!("unsupported digest method {}", other))),
    }
}

fn signature_algorithm(uri: &str) -> Result<&'static dyn VerificationAlgorithm> {
    let algorithm: &'static dyn VerificationAlgorithm = match uri {
        RSA_SHA1 => &signature::RSA_PKCS1_2048_8192_SHA1_FOR_LEGACY_USE_ONLY,
        RSA_SHA256 => &signature::RSA_PKCS1_2048_8192_SHA256,
        RSA_SHA512 => &signature::RSA_PKCS1_2048_8192_SHA512,
        ECDSA_SHA256 => &signature::ECDSA_P256_SHA256_FIXED,
        ECDSA_SHA384 => &signature::ECDSA_P384_SHA384_FIXED,
        other => return Err(denied(format!("unsupported signature method {}", other))),
    };
    Ok(algorithm)
}

/// Checks `value` over `message` with the public key of a base64 DER certificate.
fn verify_with_certificate(
    certificate: &str,
    algorithm: &'static dyn VerificationAlgorithm,
    message: &[u8],
    value: &[u8],
) -> bool {
    let Ok(der) = STANDARD.decode(certificate) else {
        return false;
    };
    let Ok((_, cert)) = x509_parser::parse_x509_certificate(&der) else {
        return false;
    };
    let key = cert.public_key().subject_public_key.data.as_ref();
    UnparsedPublicKey::new(algorithm, key).verify(message, value).is_ok()
}

/// Verifies the enveloped signature of the response, or of its first signed
/// assertion, against the IdP's pinned certificates. The key info embedded in
/// the document is never trusted.
///
/// Returns the canonical signed element without its signature: the only
/// content of the response that may be trusted.
pub fn verify(xml: &str, certificates: &[String]) -> Result<String> {
    if certificates.is_empty() {
        return Err(denied("no idp signing certificate is configured"));
    }
    let root = parse(xml)?;
    let path = signed_element_path(&root)?;
    let target = element_at(&root, &path).ok_or_else(|| denied("signed element not found"))?;
    let id = target
        .attr("ID")
        .filter(|id| !id.is_empty())
        .ok_or_else(|| denied("signed element has no ID"))?;
    let (sig_index, sig) = target
        .elements()
        .find(|(_, e)| e.local_name() == "Signature")
        .ok_or_else(|| denied("saml response is not signed"))?;
    let (info_index, signed_info) = sig
        .elements()
        .find(|(_, e)| e.local_name() == "SignedInfo")
        .ok_or_else(|| denied("signature has no SignedInfo"))?;

    let references: Vec<&Element> = signed_info
        .elements()
        .map(|(_, e)| e)
        .filter(|e| e.local_name() == "Reference")
        .collect();
    let [reference] = references.as_slice() else {
        return Err(denied("signature must carry exactly one reference"));
    };
    if reference.attr("URI") != Some(format!("#{}", id).as_str()) {
        return Err(denied("signature does not reference the signed element"));
    }

    let mut content_c14n = Canonicalization::inclusive();
    let mut enveloped = false;
    if let Some(transforms) = reference.child("Transforms") {
        for (_, transform) in transforms.elements() {
            let algorithm = transform.attr("Algorithm").unwrap_or_default();
            if algorithm == ENVELOPED {
                enveloped = true;
            } else {
                content_c14n = Canonicalization::from_algorithm(algorithm, Some(transform))?;
            }
        }
    }
    if !enveloped {
        return Err(denied("signature is not enveloped"));
    }

    let digest_method = reference
        .child("DigestMethod")
        .and_then(|m| m.attr("Algorithm"))
        .unwrap_or_default();
    let expected = decode_b64(
        &reference.child("DigestValue").map(Element::text).unwrap_or_default(),
        "digest value",
    )?;
    let mut unsigned = target.clone();
    unsigned.children.remove(sig_index);
    let content = content_c14n.canonicalize(&unsigned, &inherited_scope(&root, &path));
    let actual = digest::digest(digest_algorithm(digest_method)?, content.as_bytes());
    if actual.as_ref() != expected.as_slice() {
        return Err(denied("saml response digest does not match"));
    }

    let method = signed_info
        .child("CanonicalizationMethod")
        .ok_or_else(|| denied("signature has no canonicalization method"))?;
    let info_c14n = Canonicalization::from_algorithm(method.attr("Algorithm").unwrap_or_default(), Some(method))?;
    let mut info_path = path.clone();
    info_path.extend([sig_index, info_index]);
    let canonical_info = info_c14n.canonicalize(signed_info, &inherited_scope(&root, &info_path));

    let algorithm = signature_algorithm(
        signed_info
            .child("SignatureMethod")
            .and_then(|m| m.attr("Algorithm"))
            .unwrap_or_default(),
    )?;
    let value = decode_b64(
        &sig.child("SignatureValue").map(Element::text).unwrap_or_default(),
        "signature value",
    )?;
    if !certificates
        .iter()
        .any(|c| verify_with_certificate(c, algorithm, canonical_info.as_bytes(), &value))
    {
        return Err(denied("saml response signature does not verify against the idp certificate"));
    }
    Ok(content)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use ring::rand::SystemRandom;
    use ring::signature::EcdsaKeyPair;

    /// Stands in for the `<ds:Signature>` element until the document is signed.
    pub const SIGNATURE_SLOT: &str = "<!--signature-->";

    /// Canonical form of the first element named `local`, in document order.
    pub fn canonicalize_first(xml: &str, local: &str, c14n: &Canonicalization) -> String {
        fn find(e: &Element, local: &str, path: &mut Vec<usize>) -> bool {
            if e.local_name() == local {
                return true;
            }
            for (i, child) in e.elements() {
                path.push(i);
                if find(child, local, path) {
                    return true;
                }
                path.pop();
            }
            false
        }
        let root = parse(xml).unwrap();
        let mut path = Vec::new();
        assert!(find(&root, local, &mut path), "no {} element", local);
        c14n.canonicalize(element_at(&root, &path).unwrap(), &inherited_scope(&root, &path))
    }

    /// An identity provider with a fresh P-256 key and self-signed certificate.
    pub struct TestIdp {
        signer: EcdsaKeyPair,
        rng: SystemRandom,
        pub certificate: String,
    }

    impl TestIdp {
        pub fn new() -> Self {
            let key = rcgen::KeyPair::generate().unwrap();
            let cert = rcgen::CertificateParams::new(vec!["idp.example.com".to_string()])
                .unwrap()
                .self_signed(&key)
                .unwrap();
            let rng = SystemRandom::new();
            let signer =
                EcdsaKeyPair::from_pkcs8(&signature::ECDSA_P256_SHA256_FIXED_SIGNING, &key.serialize_der(), &rng)
                    .unwrap();
            Self {
                signer,
                rng,
                certificate: STANDARD.encode(cert.der()),
            }
        }

        /// Signs the first `local` element (which must carry `ID="<id>"`) and
        /// puts the signature where `SIGNATURE_SLOT` is.
        pub fn sign(&self, xml: &str, local: &str, id: &str) -> String {
            let c14n = Canonicalization::exclusive();
            let content = canonicalize_first(xml, local, &c14n);
            let digest_value = STANDARD.encode(digest::digest(&digest::SHA256, content.as_bytes()).as_ref());
            let signed_info = format!(
                r##"<ds:SignedInfo xmlns:ds="{DSIG_NS}"><ds:CanonicalizationMethod Algorithm="{EXC_C14N}"></ds:CanonicalizationMethod><ds:SignatureMethod Algorithm="{ECDSA_SHA256}"></ds:SignatureMethod><ds:Reference URI="#{id}"><ds:Transforms><ds:Transform Algorithm="{ENVELOPED}"></ds:Transform><ds:Transform Algorithm="{EXC_C14N}"></ds:Transform></ds:Transforms><ds:DigestMethod Algorithm="{SHA256}"></ds:DigestMethod><ds:DigestValue>{digest_value}</ds:DigestValue></ds:Reference></ds:SignedInfo>"##
            );
            let canonical_info = canonicalize_first(&signed_info, "SignedInfo", &c14n);
            let value = self.signer.sign(&self.rng, canonical_info.as_bytes()).unwrap();
            let signature = format!(
                r#"<ds:Signature xmlns:ds="{DSIG_NS}">{signed_info}<ds:SignatureValue>{}</ds:SignatureValue><ds:KeyInfo><ds:X509Data><ds:X509Certificate>{}</ds:X509Certificate></ds:X509Data></ds:KeyInfo></ds:Signature>"#,
                STANDARD.encode(value.as_ref()),
                self.certificate,
            );
            xml.replace(SIGNATURE_SLOT, &signature)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    const DOC: &str = r#"<root xmlns="urn:a" xmlns:x="urn:x" xmlns:unused="urn:u"><x:child b="2" a="1" x:c="3">t &amp; &lt;</x:child><empty/></root>"#;

    fn assertion(user: &str) -> String {
        format!(
            r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_r1">
  <saml:Assertion ID="_a1">
    <saml:Issuer>https://idp.example.com</saml:Issuer>
    {SIGNATURE_SLOT}
    <saml:Subject><saml:NameID>{user}</saml:NameID></saml:Subject>
  </saml:Assertion>
</samlp:Response>"#
        )
    }

    #[test]
    fn exclusive_form_keeps_only_used_namespaces() {
        let c14n = Canonicalization::exclusive();
        assert_eq!(
            canonicalize_first(DOC, "child", &c14n),
            r#"<x:child xmlns:x="urn:x" a="1" b="2" x:c="3">t &amp; &lt;</x:child>"#
        );
        assert_eq!(
            canonicalize_first(DOC, "root", &c14n),
            r#"<root xmlns="urn:a"><x:child xmlns:x="urn:x" a="1" b="2" x:c="3">t &amp; &lt;</x:child><empty></empty></root>"#
        );
    }

    #[test]
    fn inclusive_form_renders_every_namespace_once() {
        assert_eq!(
            canonicalize_first(DOC, "root", &Canonicalization::inclusive()),
            r#"<root xmlns="urn:a" xmlns:unused="urn:u" xmlns:x="urn:x"><x:child a="1" b="2" x:c="3">t &amp; &lt;</x:child><empty></empty></root>"#
        );
    }

    #[test]
    fn prefix_list_keeps_listed_namespaces() {
        let transform = parse(&format!(
            r#"<ds:Transform xmlns:ds="{DSIG_NS}" Algorithm="{EXC_C14N}"><ec:InclusiveNamespaces xmlns:ec="{EXC_C14N}" PrefixList="b"/></ds:Transform>"#
        ))
        .unwrap();
        let c14n = Canonicalization::from_algorithm(EXC_C14N, Some(&transform)).unwrap();
        let doc = r#"<a:root xmlns:a="urn:a" xmlns:b="urn:b"><a:x/></a:root>"#;
        assert_eq!(
            canonicalize_first(doc, "x", &c14n),
            r#"<a:x xmlns:a="urn:a" xmlns:b="urn:b"></a:x>"#
        );
        assert!(Canonicalization::from_algorithm("urn:unknown", None).is_err());
    }

    #[test]
    fn special_characters_are_escaped() {
        let doc = "<a attr=\"x&quot;y&#10;\">1 &gt; 0 &amp; 2 &lt; 3</a>";
        assert_eq!(
            canonicalize_first(doc, "a", &Canonicalization::exclusive()),
            "<a attr=\"x&quot;y&#xA;\">1 &gt; 0 &amp; 2 &lt; 3</a>"
        );
    }

    #[test]
    fn document_types_are_refused() {
        let doc = r#"<!DOCTYPE r [<!ENTITY e "boom">]><r>&e;</r>"#;
        assert!(matches!(parse(doc), Err(AuthError::BadRequest(_))));
    }

    #[test]
    fn signed_assertion_verifies() {
        let idp = TestIdp::new();
        let signed = idp.sign(&assertion("eve"), "Assertion", "_a1");

        let trusted = verify(&signed, &[idp.certificate.clone()]).unwrap();
        assert!(trusted.starts_with(r#"<saml:Assertion xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_a1">"#));
        assert!(trusted.contains("<saml:NameID>eve</saml:NameID>"));
        assert!(!trusted.contains("Signature"));
    }

    #[test]
    fn tampered_or_foreign_signatures_are_rejected() {
        let idp = TestIdp::new();
        let signed = idp.sign(&assertion("eve"), "Assertion", "_a1");

        let tampered = signed.replace(">eve<", ">mallory<");
        let err = verify(&tampered, &[idp.certificate.clone()]).unwrap_err();
        assert!(matches!(err, AuthError::Forbidden(msg) if msg.contains("digest")));

        let other = TestIdp::new();
        let err = verify(&signed, &[other.certificate.clone()]).unwrap_err();
        assert!(matches!(err, AuthError::Forbidden(msg) if msg.contains("signature")));

        assert!(matches!(verify(&signed, &[]), Err(AuthError::Forbidden(_))));
    }

    #[test]
    fn unsigned_or_incomplete_signatures_are_rejected() {
        let idp = TestIdp::new();
        let unsigned = assertion("eve").replace(SIGNATURE_SLOT, "");
        assert!(matches!(
            verify(&unsigned, &[idp.certificate.clone()]),
            Err(AuthError::Forbidden(_))
        ));

        let bare = assertion("eve").replace(
            SIGNATURE_SLOT,
            &format!(
                r#"<ds:Signature xmlns:ds="{DSIG_NS}"><ds:KeyInfo><ds:X509Data><ds:X509Certificate>{}</ds:X509Certificate></ds:X509Data></ds:KeyInfo></ds:Signature>"#,
                idp.certificate
            ),
        );
        assert!(matches!(
            verify(&bare, &[idp.certificate.clone()]),
            Err(AuthError::Forbidden(_))
        ));
    }
}
