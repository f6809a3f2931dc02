//! Form-associated behaviors: option selectedness coupled to the owning
//! select, form owner resolution and control state.

use html5ever::{namespace_url, ns, QualName};
use tracing::trace;

use super::behavior::ElementBehavior;
use super::collection::{invalidate_collections, CollectionScope, HtmlCollection};
use super::element::Element;
use super::node::Node;

/// Mutable control state that does not live in attributes.
#[derive(Debug, Default, Clone)]
pub(crate) struct FormState {
    pub(crate) selectedness: bool,
    pub(crate) dirty_selectedness: bool,
    pub(crate) dirty_value: Option<String>,
    pub(crate) checked: bool,
    pub(crate) dirty_checked: bool,
}

const LISTED_ELEMENTS: &[&str] = &["button", "fieldset", "input", "object", "output", "select", "textarea"];
const DISABLEABLE: &[&str] = &["button", "input", "select", "textarea", "fieldset", "optgroup", "option"];

fn is_plain(name: &QualName, local: &str) -> bool {
    name.ns == ns!() && &*name.local == local
}

fn is_listed(element: &Element) -> bool {
    element.is_html() && LISTED_ELEMENTS.contains(&&*element.name().local)
}

fn form_state(element: &Element) -> FormState {
    element.element_data(|data| data.form.clone()).unwrap_or_default()
}

fn update_form_state(element: &Element, f: impl FnOnce(&mut FormState)) {
    element.element_data_mut(|data| f(&mut data.form));
}

// --- option / optgroup / select ---------------------------------------------

/// The select whose list of options includes `option`: its parent, or the
/// parent of an enclosing optgroup.
fn owner_select(option: &Element) -> Option<Element> {
    let parent = option.parent_element()?;
    if parent.has_local_name("select") {
        return Some(parent);
    }
    if parent.has_local_name("optgroup") {
        return parent.parent_element().filter(|p| p.has_local_name("select"));
    }
    None
}

fn list_of_options(select: &Element) -> Vec<Element> {
    let mut options = Vec::new();
    for child in select.children_snapshot() {
        let Some(child) = child.as_element() else { continue };
        if child.has_local_name("option") {
            options.push(child);
        } else if child.has_local_name("optgroup") {
            options.extend(
                child
                    .children_snapshot()
                    .into_iter()
                    .filter_map(|n| n.as_element())
                    .filter(|e| e.has_local_name("option")),
            );
        }
    }
    options
}

fn set_selectedness(option: &Element, selected: bool) {
    update_form_state(option, |state| state.selectedness = selected);
}

fn is_selected(option: &Element) -> bool {
    form_state(option).selectedness
}

/// The selectedness setting algorithm for a select whose display size is 1.
pub(crate) fn reset_select(select: &Element) {
    if select.multiple() {
        return;
    }
    let options = list_of_options(select);
    let selected: Vec<&Element> = options.iter().filter(|o| is_selected(o)).collect();
    match selected.len() {
        0 => {
            if let Some(first) = options.iter().find(|o| !o.is_disabled()) {
                trace!(select = ?select.as_node(), "selecting first enabled option");
                set_selectedness(first, true);
            }
        }
        1 => {}
        _ => {
            let keep = selected[selected.len() - 1].clone();
            for option in &options {
                if *option != keep {
                    set_selectedness(option, false);
                }
            }
        }
    }
}

/// Gives `option` selectedness and, in a single select, takes it from the rest.
fn select_option(option: &Element) {
    set_selectedness(option, true);
    if let Some(select) = owner_select(option) {
        if !select.multiple() {
            for other in list_of_options(&select) {
                if other != *option {
                    set_selectedness(&other, false);
                }
            }
        }
    }
}

fn ask_for_reset(option: &Element) {
    if let Some(select) = owner_select(option) {
        reset_select(&select);
    }
}

pub(crate) struct OptionBehavior;

impl ElementBehavior for OptionBehavior {
    fn attribute_changed(&self, element: &Element, name: &QualName, _old: Option<&str>, new: Option<&str>) {
        if !is_plain(name, "selected") || form_state(element).dirty_selectedness {
            return;
        }
        if new.is_some() {
            select_option(element);
        } else {
            set_selectedness(element, false);
        }
        ask_for_reset(element);
    }

    fn inserted(&self, element: &Element) {
        // a freshly created option picks up its default selectedness here
        if !form_state(element).dirty_selectedness && element.has_attribute("selected") {
            set_selectedness(element, true);
        }
        ask_for_reset(element);
    }

    fn removed(&self, _element: &Element, old_parent: &Node) {
        if let Some(parent) = old_parent.as_element() {
            if parent.has_local_name("select") {
                reset_select(&parent);
            } else if let Some(select) = parent
                .parent_element()
                .filter(|p| parent.has_local_name("optgroup") && p.has_local_name("select"))
            {
                reset_select(&select);
            }
        }
    }

    fn cloned(&self, source: &Element, copy: &Element) {
        let state = form_state(source);
        update_form_state(copy, |target| {
            target.selectedness = state.selectedness;
            target.dirty_selectedness = state.dirty_selectedness;
        });
    }
}

pub(crate) struct OptGroupBehavior;

impl ElementBehavior for OptGroupBehavior {
    fn children_changed(&self, element: &Element) {
        if let Some(select) = element.parent_element().filter(|p| p.has_local_name("select")) {
            reset_select(&select);
        }
    }

    fn removed(&self, _element: &Element, old_parent: &Node) {
        if let Some(select) = old_parent.as_element().filter(|p| p.has_local_name("select")) {
            reset_select(&select);
        }
    }
}

pub(crate) struct SelectBehavior;

impl ElementBehavior for SelectBehavior {
    fn attribute_changed(&self, element: &Element, name: &QualName, _old: Option<&str>, _new: Option<&str>) {
        if is_plain(name, "multiple") {
            reset_select(element);
        } else {
            form_control_attribute_changed(element, name);
        }
    }

    fn children_changed(&self, element: &Element) {
        reset_select(element);
    }

    fn is_form_associated(&self) -> bool {
        true
    }
}

// --- form owner ---------------------------------------------------------------

fn form_control_attribute_changed(element: &Element, name: &QualName) {
    if is_plain(name, "id") || is_plain(name, "name") || is_plain(name, "form") {
        if let Some(form) = element.form() {
            invalidate_collections(&form);
        }
        if let Some(document) = element.node_document() {
            invalidate_collections(&document);
        }
    }
}

pub(crate) struct FormControlBehavior;

impl ElementBehavior for FormControlBehavior {
    fn attribute_changed(&self, element: &Element, name: &QualName, _old: Option<&str>, new: Option<&str>) {
        if is_plain(name, "checked") && !form_state(element).dirty_checked {
            update_form_state(element, |state| state.checked = new.is_some());
            if new.is_some() {
                uncheck_radio_group(element);
            }
        }
        form_control_attribute_changed(element, name);
    }

    fn inserted(&self, element: &Element) {
        if !form_state(element).dirty_checked && element.has_attribute("checked") {
            update_form_state(element, |state| state.checked = true);
        }
    }

    fn cloned(&self, source: &Element, copy: &Element) {
        let state = form_state(source);
        update_form_state(copy, |target| {
            target.dirty_value = state.dirty_value.clone();
            target.checked = state.checked;
            target.dirty_checked = state.dirty_checked;
        });
    }

    fn is_form_associated(&self) -> bool {
        true
    }
}

pub(crate) struct FormBehavior;

impl ElementBehavior for FormBehavior {}

pub(crate) static OPTION: OptionBehavior = OptionBehavior;
pub(crate) static OPTGROUP: OptGroupBehavior = OptGroupBehavior;
pub(crate) static SELECT: SelectBehavior = SelectBehavior;
pub(crate) static FORM_CONTROL: FormControlBehavior = FormControlBehavior;
pub(crate) static FORM: FormBehavior = FormBehavior;

fn is_radio(element: &Element) -> bool {
    element.has_local_name("input")
        && element
            .get_attribute("type")
            .is_some_and(|t| t.eq_ignore_ascii_case("radio"))
}

/// Unchecks the other radios sharing `element`'s group.
fn uncheck_radio_group(element: &Element) {
    if !is_radio(element) {
        return;
    }
    let Some(name) = element.get_attribute("name").filter(|n| !n.is_empty()) else {
        return;
    };
    let owner = element.form();
    let root = element.get_root_node(false);
    for other in root.descendant_elements() {
        if other == *element || !is_radio(&other) {
            continue;
        }
        if other.get_attribute("name").as_deref() == Some(name.as_str()) && other.form() == owner {
            update_form_state(&other, |state| state.checked = false);
        }
    }
}

impl Element {
    /// Form owner: the element named by a `form` attribute, or the nearest
    /// ancestor `<form>`.
    pub fn form(&self) -> Option<Element> {
        let associated = self.behavior().is_form_associated() || self.has_local_name("option");
        if !associated {
            return None;
        }
        if self.has_local_name("option") {
            return owner_select(self).and_then(|select| select.form());
        }
        if let Some(id) = self.get_attribute("form") {
            if !self.is_connected() {
                return None;
            }
            return self
                .node_document()
                .and_then(|doc| doc.get_element_by_id(&id))
                .filter(|e| e.has_local_name("form"));
        }
        self.ancestors()
            .filter_map(|n| n.as_element())
            .find(|e| e.has_local_name("form"))
    }

    /// Disabled per the form-control rules; always `false` for other elements.
    pub fn is_disabled(&self) -> bool {
        if !self.is_html() || !DISABLEABLE.contains(&&*self.name().local) {
            return false;
        }
        if self.has_attribute("disabled") {
            return true;
        }
        if self.has_local_name("option") {
            return self
                .parent_element()
                .is_some_and(|p| p.has_local_name("optgroup") && p.has_attribute("disabled"));
        }
        if self.has_local_name("optgroup") {
            return false;
        }
        self.ancestors()
            .filter_map(|n| n.as_element())
            .any(|e| e.has_local_name("fieldset") && e.has_attribute("disabled"))
    }

    pub fn set_disabled(&self, disabled: bool) {
        if disabled {
            self.set_attribute_unchecked("disabled", "");
        } else {
            self.remove_attribute("disabled");
        }
    }

    pub fn name_attribute(&self) -> String {
        self.get_attribute("name").unwrap_or_default()
    }

    // --- option -----------------------------------------------------------

    pub fn selected(&self) -> bool {
        self.has_local_name("option") && is_selected(self)
    }

    pub fn set_selected(&self, selected: bool) {
        if !self.has_local_name("option") {
            return;
        }
        update_form_state(self, |state| state.dirty_selectedness = true);
        if selected {
            select_option(self);
        } else {
            set_selectedness(self, false);
        }
        ask_for_reset(self);
    }

    pub fn default_selected(&self) -> bool {
        self.has_attribute("selected")
    }

    /// Option text with whitespace collapsed.
    pub fn text(&self) -> String {
        let raw = self.descendant_text();
        super::split_tokens(&raw).collect::<Vec<_>>().join(" ")
    }

    pub fn label(&self) -> String {
        match self.get_attribute("label") {
            Some(label) if !label.is_empty() => label,
            _ => self.text(),
        }
    }

    /// `index` of an option within its select's options, 0 when unowned.
    pub fn option_index(&self) -> usize {
        owner_select(self)
            .and_then(|select| list_of_options(&select).iter().position(|o| o == self))
            .unwrap_or(0)
    }

    // --- select -----------------------------------------------------------

    pub fn multiple(&self) -> bool {
        self.has_attribute("multiple")
    }

    /// Live options of a select.
    pub fn options(&self) -> HtmlCollection {
        let select = self.clone();
        HtmlCollection::new(self.as_node(), CollectionScope::Descendants, move |element| {
            element.has_local_name("option") && owner_select(element).as_ref() == Some(&select)
        })
    }

    pub fn selected_options(&self) -> Vec<Element> {
        list_of_options(self).into_iter().filter(is_selected).collect()
    }

    /// -1 when nothing is selected.
    pub fn selected_index(&self) -> i32 {
        list_of_options(self)
            .iter()
            .position(is_selected)
            .map_or(-1, |index| index as i32)
    }

    pub fn set_selected_index(&self, index: i32) {
        let options = list_of_options(self);
        for option in &options {
            set_selectedness(option, false);
        }
        if let Some(option) = usize::try_from(index).ok().and_then(|i| options.get(i)) {
            update_form_state(option, |state| {
                state.selectedness = true;
                state.dirty_selectedness = true;
            });
        }
    }

    // --- value ------------------------------------------------------------

    /// `value` of options, selects, inputs, textareas and buttons.
    pub fn value(&self) -> String {
        if self.has_local_name("option") {
            return self.get_attribute("value").unwrap_or_else(|| self.text());
        }
        if self.has_local_name("select") {
            return self
                .selected_options()
                .first()
                .map(Element::value)
                .unwrap_or_default();
        }
        if let Some(value) = form_state(self).dirty_value {
            return value;
        }
        if self.has_local_name("textarea") {
            return self.child_text_content();
        }
        if is_radio(self) || self.get_attribute("type").is_some_and(|t| t.eq_ignore_ascii_case("checkbox")) {
            return self.get_attribute("value").unwrap_or_else(|| "on".into());
        }
        self.get_attribute("value").unwrap_or_default()
    }

    pub fn set_value(&self, value: &str) {
        if self.has_local_name("option") {
            self.set_attribute_unchecked("value", value);
            return;
        }
        if self.has_local_name("select") {
            let options = list_of_options(self);
            let mut found = false;
            for option in &options {
                let matches = !found && option.value() == value;
                found |= matches;
                update_form_state(option, |state| {
                    state.selectedness = matches;
                    if matches {
                        state.dirty_selectedness = true;
                    }
                });
            }
            return;
        }
        if self.behavior().is_form_associated() {
            update_form_state(self, |state| state.dirty_value = Some(value.to_string()));
        }
    }

    pub fn default_value(&self) -> String {
        if self.has_local_name("textarea") {
            return self.child_text_content();
        }
        self.get_attribute("value").unwrap_or_default()
    }

    pub fn checked(&self) -> bool {
        form_state(self).checked
    }

    pub fn set_checked(&self, checked: bool) {
        if !self.has_local_name("input") {
            return;
        }
        update_form_state(self, |state| {
            state.checked = checked;
            state.dirty_checked = true;
        });
        if checked {
            uncheck_radio_group(self);
        }
    }

    // --- form -------------------------------------------------------------

    /// Live listed controls whose form owner is this form.
    pub fn elements(&self) -> HtmlCollection {
        let form = self.clone();
        let root = match self.node_document() {
            Some(document) if self.is_connected() => document.0,
            _ => self.as_node().clone(),
        };
        HtmlCollection::new(&root, CollectionScope::Descendants, move |element| {
            is_listed(element) && element.form().as_ref() == Some(&form)
        })
    }

    pub fn named_item(&self, name: &str) -> Option<Element> {
        self.elements().named_item(name)
    }

    pub fn form_length(&self) -> usize {
        self.elements().length()
    }

    /// Restores every control of a form to its default state.
    pub fn reset(&self) {
        if !self.has_local_name("form") {
            return;
        }
        for control in self.elements().iter() {
            update_form_state(&control, |state| {
                state.dirty_value = None;
                state.dirty_checked = false;
            });
            let checked = control.has_attribute("checked");
            update_form_state(&control, |state| state.checked = checked);
            if control.has_local_name("select") {
                for option in list_of_options(&control) {
                    let default = option.has_attribute("selected");
                    update_form_state(&option, |state| {
                        state.selectedness = default;
                        state.dirty_selectedness = false;
                    });
                }
                reset_select(&control);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::core::dom::Document;

    fn select_with(doc: &Document, markup: &str) -> crate::core::dom::Element {
        let body = doc.body().unwrap();
        body.set_inner_html(markup).unwrap();
        body.query_selector("select").unwrap().unwrap()
    }

    #[test]
    fn first_option_is_selected_by_default() {
        let doc = Document::new();
        let select = select_with(&doc, "<select><option>a</option><option>b</option></select>");
        assert_eq!(select.selected_index(), 0);
        assert_eq!(select.value(), "a");
    }

    #[test]
    fn selected_attribute_drives_selected_index() {
        let doc = Document::new();
        let select = select_with(&doc, "<select><option>a</option><option>b</option></select>");
        let options = select.options();
        let second = options.item(1).unwrap();
        second.set_attribute("selected", "").unwrap();
        assert_eq!(select.selected_index(), 1);
        assert!(!options.item(0).unwrap().selected());

        second.remove_attribute("selected");
        assert_eq!(select.selected_index(), 0);
    }

    #[test]
    fn dirty_options_ignore_attribute_changes() {
        let doc = Document::new();
        let select = select_with(&doc, "<select><option>a</option><option>b</option></select>");
        let second = select.options().item(1).unwrap();
        second.set_selected(true);
        assert_eq!(select.selected_index(), 1);
        select.options().item(0).unwrap().set_selected(true);
        second.set_attribute("selected", "").unwrap();
        assert_eq!(select.selected_index(), 0);
    }

    #[test]
    fn multiple_selects_allow_no_selection() {
        let doc = Document::new();
        let select = select_with(
            &doc,
            "<select multiple><option>a</option><option selected>b</option><option selected>c</option></select>",
        );
        assert_eq!(select.selected_options().len(), 2);
        select.set_selected_index(-1);
        assert_eq!(select.selected_index(), -1);
    }

    #[test]
    fn optgroup_options_belong_to_select() {
        let doc = Document::new();
        let select = select_with(
            &doc,
            "<select><optgroup label=g><option value=x>X</option></optgroup><option value=y>Y</option></select>",
        );
        assert_eq!(select.options().length(), 2);
        select.set_value("y");
        assert_eq!(select.selected_index(), 1);
        assert_eq!(select.options().item(1).unwrap().option_index(), 1);
    }

    #[test]
    fn removing_the_selected_option_reselects() {
        let doc = Document::new();
        let select = select_with(&doc, "<select><option>a</option><option selected>b</option></select>");
        assert_eq!(select.selected_index(), 1);
        select.options().item(1).unwrap().remove();
        assert_eq!(select.selected_index(), 0);
    }

    #[test]
    fn form_elements_follow_form_attribute() {
        let doc = Document::new();
        let body = doc.body().unwrap();
        body.set_inner_html(
            "<form id=f><input name=a><fieldset disabled><button name=b></button></fieldset></form><input name=c form=f>",
        )
        .unwrap();
        let form = doc.get_element_by_id("f").unwrap();
        let elements = form.elements();
        assert_eq!(elements.length(), 4);
        assert!(form.named_item("c").is_some());
        assert!(form.named_item("b").unwrap().is_disabled());
        let outside = body.query_selector("input[name=c]").unwrap().unwrap();
        outside.remove_attribute("form");
        assert_eq!(elements.length(), 3);
    }

    #[test]
    fn radio_groups_are_exclusive() {
        let doc = Document::new();
        let body = doc.body().unwrap();
        body.set_inner_html("<input type=radio name=r checked><input type=radio name=r>").unwrap();
        let radios = body.query_selector_all("input").unwrap();
        let first = radios.item(0).unwrap().as_element().unwrap();
        let second = radios.item(1).unwrap().as_element().unwrap();
        assert!(first.checked());
        second.set_checked(true);
        assert!(!first.checked());
        assert_eq!(second.value(), "on");
    }

    #[test]
    fn input_value_is_dirty_after_set() {
        let doc = Document::new();
        let input = doc.create_element("input").unwrap();
        input.set_attribute("value", "a").unwrap();
        input.set_value("b");
        assert_eq!(input.value(), "b");
        assert_eq!(input.default_value(), "a");
    }
}
