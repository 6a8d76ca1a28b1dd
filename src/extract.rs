//! Field extraction from rendered HTML.
//!
//! CSS selectors go through `scraper`. XPath expressions are evaluated with
//! `sxd-xpath` over a copy of the html5ever tree, so they work on the same
//! forgiving parse as CSS. Selectors that fail to parse are logged and yield
//! nothing.

use log::error;
use scraper::{ElementRef, Html, Selector};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use sxd_document::dom::{self, ChildOfElement};
use sxd_document::Package;
use sxd_xpath::nodeset::Node;
use sxd_xpath::Value;

/// Post-processing applied to an extracted field value
pub type Processor = Box<dyn Fn(String) -> String + Send + Sync>;

/// Length and word count of a piece of text
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TextMetrics {
    pub length: usize,
    pub word_count: usize,
    pub has_text: bool,
}

/// A URL split into its parts; `domain` is the host without a port
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UrlComponents {
    pub scheme: String,
    pub netloc: String,
    pub path: String,
    pub query: String,
    pub fragment: String,
    pub domain: String,
}

/// How a selector string is interpreted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SelectorKind {
    #[default]
    Css,
    XPath,
}

impl SelectorKind {
    /// XPath for absolute, relative-to-context or parenthesized expressions
    pub fn detect(selector: &str) -> Self {
        let s = selector.trim_start();
        if s.starts_with('/') || s.starts_with("./") || s.starts_with('(') {
            SelectorKind::XPath
        } else {
            SelectorKind::Css
        }
    }
}

fn parse_selector(selector: &str) -> Option<Selector> {
    match Selector::parse(selector) {
        Ok(sel) => Some(sel),
        Err(e) => {
            error!("Invalid selector {}: {:?}", selector, e);
            None
        }
    }
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

fn copy_element<'d>(xml: &dom::Document<'d>, from: ElementRef<'_>) -> dom::Element<'d> {
    let element = xml.create_element(from.value().name());
    for (name, value) in from.value().attrs() {
        element.set_attribute_value(name, value);
    }
    for child in from.children() {
        if let Some(child_element) = ElementRef::wrap(child) {
            element.append_child(copy_element(xml, child_element));
        } else if let scraper::Node::Text(text) = child.value() {
            element.append_child(xml.create_text(text));
        }
    }
    element
}

fn escape_into(out: &mut String, text: &str) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
}

fn write_element(out: &mut String, element: dom::Element<'_>) {
    let name = element.name().local_part();
    let _ = write!(out, "<{}", name);
    for attr in element.attributes() {
        let _ = write!(out, " {}=\"", attr.name().local_part());
        escape_into(out, attr.value());
        out.push('"');
    }
    out.push('>');
    for child in element.children() {
        match child {
            ChildOfElement::Element(e) => write_element(out, e),
            ChildOfElement::Text(t) => escape_into(out, t.text()),
            _ => {}
        }
    }
    let _ = write!(out, "</{}>", name);
}

/// Markup for elements, the string value for anything else
fn node_markup(node: Node<'_>) -> String {
    match node {
        Node::Element(element) => {
            let mut out = String::new();
            write_element(&mut out, element);
            out
        }
        other => other.string_value(),
    }
}

fn node_text(node: Node<'_>) -> String {
    node.string_value().trim().to_string()
}

/// The HTML tree copied into an XML document for XPath evaluation
struct XPathDocument {
    package: Package,
}

impl XPathDocument {
    fn parse(html: &str) -> Self {
        let document = Html::parse_document(html);
        let package = Package::new();
        {
            let xml = package.as_document();
            let root = copy_element(&xml, document.root_element());
            xml.root().append_child(root);
        }
        Self { package }
    }

    /// Every result of `expr` rendered by `render`; scalar results become a
    /// single string. `None` when the expression is invalid.
    fn values(&self, expr: &str, render: fn(Node<'_>) -> String) -> Option<Vec<String>> {
        let xml = self.package.as_document();
        let result = sxd_xpath::evaluate_xpath(&xml, expr);
        match result {
            Ok(Value::Nodeset(nodes)) => Some(nodes.document_order().into_iter().map(render).collect()),
            Ok(scalar) => Some(vec![scalar.into_string()]),
            Err(e) => {
                error!("Invalid XPath {}: {:?}", expr, e);
                None
            }
        }
    }

    fn first_text(&self, expr: &str) -> Option<String> {
        self.values(expr, node_text)?.into_iter().next()
    }
}

/// `field` evaluated inside the `index`th (1-based) match of `item`
fn item_xpath(item: &str, index: usize, field: &str) -> String {
    let field = field.trim_start();
    if field.starts_with('/') {
        field.to_string()
    } else {
        format!("({})[{}]/{}", item, index, field)
    }
}

/// Stateless extraction helpers
#[derive(Debug, Clone, Copy, Default)]
pub struct Extractor;

impl Extractor {
    pub fn new() -> Self {
        Self
    }

    /// First-match text for each field, then the field's processor if any.
    /// Each selector's kind is taken from its shape ([`SelectorKind::detect`]).
    ///
    /// Fields without a match map to `None`.
    pub fn extract_with_selectors(
        &self,
        html: &str,
        selectors: &BTreeMap<String, String>,
        processors: &HashMap<String, Processor>,
    ) -> BTreeMap<String, Option<String>> {
        let document = Html::parse_document(html);
        let xml = selectors
            .values()
            .any(|s| SelectorKind::detect(s) == SelectorKind::XPath)
            .then(|| XPathDocument::parse(html));
        selectors
            .iter()
            .map(|(field, selector)| {
                let found = match (SelectorKind::detect(selector), &xml) {
                    (SelectorKind::XPath, Some(xml)) => xml.first_text(selector),
                    _ => parse_selector(selector)
                        .and_then(|sel| document.select(&sel).next().map(element_text)),
                };
                let value = found
                    .map(|text| match processors.get(field) {
                        Some(process) => process(text),
                        None => text,
                    });
                (field.clone(), value)
            })
            .collect()
    }

    /// Outer HTML of every match. XPath results that are not elements
    /// (text, attributes, scalars) come back as their string value.
    pub fn extract_multiple(&self, html: &str, selector: &str, kind: SelectorKind) -> Vec<String> {
        if kind == SelectorKind::XPath {
            return XPathDocument::parse(html)
                .values(selector, node_markup)
                .unwrap_or_default();
        }
        let Some(sel) = parse_selector(selector) else {
            return Vec::new();
        };
        let document = Html::parse_document(html);
        let matches = document.select(&sel).map(|el| el.html()).collect();
        matches
    }

    /// One record per `item_selector` match; each field is the text of the
    /// first match of its selector inside the item. With XPath, field
    /// expressions are relative to the item unless they start with `/`.
    pub fn extract_structured_list(
        &self,
        html: &str,
        item_selector: &str,
        field_selectors: &BTreeMap<String, String>,
        kind: SelectorKind,
    ) -> Vec<BTreeMap<String, Option<String>>> {
        if kind == SelectorKind::XPath {
            let xml = XPathDocument::parse(html);
            let count = xml.values(item_selector, node_text).map_or(0, |items| items.len());
            return (1..=count)
                .map(|index| {
                    field_selectors
                        .iter()
                        .map(|(field, selector)| {
                            (field.clone(), xml.first_text(&item_xpath(item_selector, index, selector)))
                        })
                        .collect()
                })
                .collect();
        }
        let Some(items) = parse_selector(item_selector) else {
            return Vec::new();
        };
        let fields: Vec<(&String, Option<Selector>)> = field_selectors
            .iter()
            .map(|(field, selector)| (field, parse_selector(selector)))
            .collect();

        let document = Html::parse_document(html);
        let records = document
            .select(&items)
            .map(|item| {
                fields
                    .iter()
                    .map(|(field, sel)| {
                        let value = sel
                            .as_ref()
                            .and_then(|sel| item.select(sel).next())
                            .map(element_text);
                        ((*field).clone(), value)
                    })
                    .collect()
            })
            .collect();
        records
    }

    /// Text of the first match
    pub fn extract_text(&self, html: &str, selector: &str) -> Option<String> {
        let sel = parse_selector(selector)?;
        let document = Html::parse_document(html);
        let text = document.select(&sel).next().map(element_text);
        text
    }

    /// Collapse whitespace runs to single spaces and trim.
    pub fn clean_text(&self, text: &str) -> String {
        text.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    pub fn text_metrics(&self, text: Option<&str>) -> TextMetrics {
        let cleaned = self.clean_text(text.unwrap_or(""));
        TextMetrics {
            length: cleaned.chars().count(),
            word_count: cleaned.split(' ').filter(|w| !w.is_empty()).count(),
            has_text: !cleaned.is_empty(),
        }
    }

    /// `None` for text that does not parse as an absolute URL
    pub fn url_components(&self, url: &str) -> Option<UrlComponents> {
        let parsed = match url::Url::parse(url) {
            Ok(parsed) => parsed,
            Err(e) => {
                error!("Error parsing URL {}: {}", url, e);
                return None;
            }
        };
        let domain = parsed.host_str().unwrap_or_default().to_string();
        let netloc = match parsed.port() {
            Some(port) => format!("{}:{}", domain, port),
            None => domain.clone(),
        };
        Some(UrlComponents {
            scheme: parsed.scheme().to_string(),
            netloc,
            path: parsed.path().to_string(),
            query: parsed.query().unwrap_or_default().to_string(),
            fragment: parsed.fragment().unwrap_or_default().to_string(),
            domain,
        })
    }
}
