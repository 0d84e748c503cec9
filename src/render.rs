use egui::{Color32, FontId, Painter, Pos2, Rect, Stroke, StrokeKind, Vec2};
use greentouch::sink::SensorContact;

pub const MAGENTA: Color32 = Color32::from_rgb(255, 0, 182);
pub const TEAL: Color32 = Color32::from_rgb(0, 213, 255);
pub const ORANGE: Color32 = Color32::from_rgb(255, 101, 0);

fn fade(color: Color32, alpha: f32) -> Color32 {
    Color32::from_rgba_unmultiplied(color.r(), color.g(), color.b(), (255.0 * alpha) as u8)
}

fn color_for_slot(slot: usize) -> Color32 {
    if slot == 0 {
        MAGENTA
    } else {
        TEAL
    }
}

pub fn draw_sensor_boundary(painter: &Painter, corner: Pos2, width: f32, height: f32) {
    painter.rect_stroke(
        Rect::from_min_size(corner, Vec2::new(width, height)),
        0.0,
        Stroke::new(1.0, ORANGE),
        StrokeKind::Outside,
    );
}

pub fn draw_ring(
    painter: &Painter,
    center: Pos2,
    inner_radius: f32,
    outer_radius: f32,
    color: Color32,
) {
    let mid_radius = (inner_radius + outer_radius) / 2.0;
    let thickness = outer_radius - inner_radius;
    painter.circle_stroke(center, mid_radius, Stroke::new(thickness, color));
}

pub fn draw_trail(painter: &Painter, contact: &SensorContact, corner: Pos2, scale: f32, cscale: f32) {
    let pos = center_on_screen(contact, corner, scale);
    let color = fade(color_for_slot(contact.slot), 0.2);
    draw_ring(painter, pos, 1.0, 20.0 * cscale, color);
}

pub fn draw_contact(
    painter: &Painter,
    contact: &SensorContact,
    corner: Pos2,
    scale: f32,
    cscale: f32,
) {
    let color = color_for_slot(contact.slot);

    // Bounding box in cell resolution
    let min = Pos2::new(
        corner.x + contact.x as f32 * scale,
        corner.y + contact.y as f32 * scale,
    );
    let size = Vec2::new(contact.width as f32 * scale, contact.height as f32 * scale);
    painter.rect_filled(Rect::from_min_size(min, size), 2.0, fade(color, 0.35));

    let pos = center_on_screen(contact, corner, scale);
    painter.circle_filled(pos, 18.0 * cscale, color);

    // Slot number label
    let label_pos = Pos2::new(pos.x - 10.0 * cscale, pos.y - 50.0 * cscale);
    painter.text(
        label_pos,
        egui::Align2::LEFT_TOP,
        format!("{}", contact.slot),
        FontId::monospace(28.0 * cscale),
        Color32::BLACK,
    );
}

fn center_on_screen(contact: &SensorContact, corner: Pos2, scale: f32) -> Pos2 {
    Pos2::new(
        corner.x + (contact.x as f32 + contact.width as f32 / 2.0) * scale,
        corner.y + (contact.y as f32 + contact.height as f32 / 2.0) * scale,
    )
}
